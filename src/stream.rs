//! Query stream definitions as produced by the stream generator.
//!
//! A stream file looks like
//! `{ "database_id": 1, "scale_factor": 10, "queries": [{ "query_id": 3, "start": 1500, "arguments": ["BUILDING"] }] }`.
//! Any other top-level keys are kept as metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// A bind argument or identifier: JSON number or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledQuery {
    pub query_id: u32,
    /// Milliseconds after the run epoch at which the query should begin.
    #[serde(rename = "start")]
    pub start_offset_ms: u64,
    #[serde(default)]
    pub arguments: Vec<Scalar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStream {
    pub database_id: Scalar,
    pub scale_factor: Scalar,
    #[serde(default)]
    pub queries: Vec<ScheduledQuery>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn stream_path(dir: &Path, stream_id: u32) -> PathBuf {
    dir.join(format!("query_stream_{stream_id}.json"))
}

impl QueryStream {
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Read `query_stream_<id>.json` from `dir`.
    pub fn load(dir: &Path, stream_id: u32) -> Result<Self> {
        let path = stream_path(dir, stream_id);
        let data = std::fs::read_to_string(&path).map_err(|e| BenchError::StreamLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Self::from_json(&data).map_err(|e| BenchError::StreamLoad {
            path,
            message: e.to_string(),
        })
    }

    /// Distinct query ids, ascending.
    pub fn query_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.queries.iter().map(|q| q.query_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Stream metadata without the query list.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMeta {
    pub database_id: Scalar,
    pub scale_factor: Scalar,
}

impl StreamMeta {
    pub fn scale_factor_f64(&self) -> f64 {
        match &self.scale_factor {
            Scalar::Int(v) => *v as f64,
            Scalar::Float(v) => *v,
            Scalar::Text(v) => v.parse().unwrap_or(0.0),
        }
    }
}

/// Read `query_stream_0.json`, `query_stream_1.json`, ... until the first gap.
pub fn load_stream_meta(dir: &Path) -> Result<Vec<StreamMeta>> {
    let mut metas = Vec::new();
    for stream_id in 0.. {
        let path = stream_path(dir, stream_id);
        if !path.exists() {
            break;
        }
        let data = std::fs::read_to_string(&path).map_err(|e| BenchError::StreamLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let meta: StreamMeta = serde_json::from_str(&data).map_err(|e| BenchError::StreamLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;
        metas.push(meta);
    }

    if metas.is_empty() {
        return Err(BenchError::StreamLoad {
            path: stream_path(dir, 0),
            message: "no query streams found, the first one must be query_stream_0.json".into(),
        });
    }
    Ok(metas)
}
