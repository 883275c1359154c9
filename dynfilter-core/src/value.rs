use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Decimal128Type, Float32Type, Float64Type, Int16Type,
    Int32Type, Int64Type, Int8Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use dynfilter_common::{DynamicFilterError, Result};
use serde::{Deserialize, Serialize};

/// A build-side key read out of a column, comparable and hashable.
///
/// Floats are stored as normalized bits so that `0.0`/`-0.0` and all NaN
/// payloads compare equal, which keeps `Eq`/`Hash` lawful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NativeValue {
    Boolean(bool),
    Int(i64),
    UInt(u64),
    Float(u64),
    Utf8(String),
    Binary(Vec<u8>),
    Date32(i32),
    Date64(i64),
    Timestamp(i64),
    Decimal128(i128),
}

impl NativeValue {
    pub fn float(v: f64) -> Self {
        let v = if v == 0.0 {
            0.0
        } else if v.is_nan() {
            f64::NAN
        } else {
            v
        };
        NativeValue::Float(v.to_bits())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Canonical string form hashed into distributed partial results.
    pub fn to_filter_string(&self) -> String {
        match self {
            NativeValue::Boolean(b) => b.to_string(),
            NativeValue::Int(v) => v.to_string(),
            NativeValue::UInt(v) => v.to_string(),
            NativeValue::Float(bits) => f64::from_bits(*bits).to_string(),
            NativeValue::Utf8(s) => s.clone(),
            NativeValue::Binary(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
            NativeValue::Date32(v) => v.to_string(),
            NativeValue::Date64(v) => v.to_string(),
            NativeValue::Timestamp(v) => v.to_string(),
            NativeValue::Decimal128(v) => v.to_string(),
        }
    }

    /// Rough retained size: inline enum plus any heap payload.
    pub fn estimated_size(&self) -> usize {
        let heap = match self {
            NativeValue::Utf8(s) => s.capacity(),
            NativeValue::Binary(b) => b.capacity(),
            _ => 0,
        };
        std::mem::size_of::<NativeValue>() + heap
    }
}

/// Fails for column types the typed-value source cannot read.
pub fn check_supported(data_type: &DataType) -> Result<()> {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64
        | DataType::Utf8
        | DataType::LargeUtf8
        | DataType::Binary
        | DataType::LargeBinary
        | DataType::Date32
        | DataType::Date64
        | DataType::Timestamp(_, _)
        | DataType::Decimal128(_, _) => Ok(()),
        other => Err(DynamicFilterError::UnsupportedType(other.clone())),
    }
}

/// Reads the value at `row`, `None` for a null slot.
///
/// Callers are expected to have validated the type with [`check_supported`];
/// a mismatched array surfaces as `UnsupportedType`.
pub fn read_native_value(array: &dyn Array, row: usize) -> Result<Option<NativeValue>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let v = match array.data_type() {
        DataType::Boolean => NativeValue::Boolean(array.as_boolean().value(row)),
        DataType::Int8 => NativeValue::Int(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => NativeValue::Int(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => NativeValue::Int(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => NativeValue::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => NativeValue::UInt(array.as_primitive::<UInt8Type>().value(row) as u64),
        DataType::UInt16 => {
            NativeValue::UInt(array.as_primitive::<UInt16Type>().value(row) as u64)
        }
        DataType::UInt32 => {
            NativeValue::UInt(array.as_primitive::<UInt32Type>().value(row) as u64)
        }
        DataType::UInt64 => NativeValue::UInt(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => {
            NativeValue::float(array.as_primitive::<Float32Type>().value(row) as f64)
        }
        DataType::Float64 => NativeValue::float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => NativeValue::Utf8(array.as_string::<i32>().value(row).to_owned()),
        DataType::LargeUtf8 => NativeValue::Utf8(array.as_string::<i64>().value(row).to_owned()),
        DataType::Binary => NativeValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => {
            NativeValue::Binary(array.as_binary::<i64>().value(row).to_vec())
        }
        DataType::Date32 => NativeValue::Date32(array.as_primitive::<Date32Type>().value(row)),
        DataType::Date64 => NativeValue::Date64(array.as_primitive::<Date64Type>().value(row)),
        DataType::Timestamp(unit, _) => NativeValue::Timestamp(match unit {
            TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
            TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(row),
            TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(row),
            TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
        }),
        DataType::Decimal128(_, _) => {
            NativeValue::Decimal128(array.as_primitive::<Decimal128Type>().value(row))
        }
        other => return Err(DynamicFilterError::UnsupportedType(other.clone())),
    };
    Ok(Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BinaryArray, Float64Array, Int32Array, StringArray};
    use arrow::datatypes::Field;

    #[test]
    fn reads_ints_and_nulls() {
        let arr = Int32Array::from(vec![Some(7), None]);
        assert_eq!(read_native_value(&arr, 0).unwrap(), Some(NativeValue::Int(7)));
        assert_eq!(read_native_value(&arr, 1).unwrap(), None);
    }

    #[test]
    fn string_forms() {
        let arr = StringArray::from(vec!["abc"]);
        let v = read_native_value(&arr, 0).unwrap().unwrap();
        assert_eq!(v.to_filter_string(), "abc");
        let bin = BinaryArray::from(vec![&[0x0au8, 0xff][..]]);
        let v = read_native_value(&bin, 0).unwrap().unwrap();
        assert_eq!(v.to_filter_string(), "0aff");
        assert_eq!(NativeValue::Int(-3).to_filter_string(), "-3");
    }

    #[test]
    fn floats_normalize_zero_and_nan() {
        assert_eq!(NativeValue::float(0.0), NativeValue::float(-0.0));
        assert_eq!(NativeValue::float(f64::NAN), NativeValue::float(-f64::NAN));
        let arr = Float64Array::from(vec![1.5]);
        let v = read_native_value(&arr, 0).unwrap().unwrap();
        assert_eq!(v.as_f64(), Some(1.5));
    }

    #[test]
    fn rejects_nested_types() {
        let dt = DataType::List(std::sync::Arc::new(Field::new("item", DataType::Int32, true)));
        assert!(matches!(
            check_supported(&dt),
            Err(DynamicFilterError::UnsupportedType(_))
        ));
        assert!(check_supported(&DataType::Utf8).is_ok());
    }
}
