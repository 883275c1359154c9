use crate::value::check_supported;
use arrow::datatypes::DataType;
use dynfilter_common::{DynamicFilterError, FilterEncoding, FilterScope, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One build-side column feeding a dynamic filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub filter_id: String,
    pub query_id: String,
    pub data_type: DataType,
    /// column position inside incoming pages
    pub source_index: usize,
}

impl Channel {
    pub fn new(
        filter_id: impl Into<String>,
        data_type: DataType,
        source_index: usize,
        query_id: impl Into<String>,
    ) -> Self {
        Self {
            filter_id: filter_id.into(),
            query_id: query_id.into(),
            data_type,
            source_index,
        }
    }
}

/// Scope and encoding, fixed once per operator factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterKind {
    pub scope: FilterScope,
    pub encoding: FilterEncoding,
}

impl FilterKind {
    pub fn new(scope: FilterScope, encoding: FilterEncoding) -> Self {
        Self { scope, encoding }
    }

    pub fn tag(&self) -> EncodingTag {
        match (self.encoding, self.scope) {
            (FilterEncoding::Bloom, FilterScope::Global) => EncodingTag::BloomFilterGlobal,
            (FilterEncoding::Bloom, FilterScope::Local) => EncodingTag::BloomFilterLocal,
            (FilterEncoding::Hashset, FilterScope::Global) => EncodingTag::HashsetGlobal,
            (FilterEncoding::Hashset, FilterScope::Local) => EncodingTag::HashsetLocal,
        }
    }
}

/// Encoding marker written to the shared type map so readers know how to
/// decode PARTIAL entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncodingTag {
    BloomFilterGlobal,
    BloomFilterLocal,
    HashsetGlobal,
    HashsetLocal,
}

impl EncodingTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingTag::BloomFilterGlobal => "BLOOM_FILTER_GLOBAL",
            EncodingTag::BloomFilterLocal => "BLOOM_FILTER_LOCAL",
            EncodingTag::HashsetGlobal => "HASHSET_GLOBAL",
            EncodingTag::HashsetLocal => "HASHSET_LOCAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BLOOM_FILTER_GLOBAL" => Some(EncodingTag::BloomFilterGlobal),
            "BLOOM_FILTER_LOCAL" => Some(EncodingTag::BloomFilterLocal),
            "HASHSET_GLOBAL" => Some(EncodingTag::HashsetGlobal),
            "HASHSET_LOCAL" => Some(EncodingTag::HashsetLocal),
            _ => None,
        }
    }

    pub fn is_bloom(&self) -> bool {
        matches!(
            self,
            EncodingTag::BloomFilterGlobal | EncodingTag::BloomFilterLocal
        )
    }
}

/// Rejects duplicate filter ids, duplicate source indices and unreadable types.
pub fn validate_channels(channels: &[Channel]) -> Result<()> {
    let ids: HashSet<&str> = channels.iter().map(|c| c.filter_id.as_str()).collect();
    if ids.len() != channels.len() {
        return Err(DynamicFilterError::InvalidChannels(
            "duplicate dynamic filters are not allowed".into(),
        ));
    }
    let indices: HashSet<usize> = channels.iter().map(|c| c.source_index).collect();
    if indices.len() != channels.len() {
        return Err(DynamicFilterError::InvalidChannels(
            "duplicate channel indices are not allowed".into(),
        ));
    }
    for c in channels {
        check_supported(&c.data_type)?;
    }
    Ok(())
}

/// Every channel of an operator must belong to the query it runs for, since
/// store keys are built from that query id.
pub fn validate_query_id(channels: &[Channel], query_id: &str) -> Result<()> {
    match channels.iter().find(|c| c.query_id != query_id) {
        Some(c) => Err(DynamicFilterError::InvalidChannels(format!(
            "dynamic filter {} belongs to query {}, operator runs query {query_id}",
            c.filter_id, c.query_id
        ))),
        None => Ok(()),
    }
}
