//! Data points in the shape the downstream time-series store expects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::summary::Summary;
use crate::tags::{Tags, TagSet};

/// Measurement name every summary is filed under.
pub const MEASUREMENT: &str = "raw_stats";

/// A single InfluxDB-style point: numeric fields plus string tags.
///
/// Fields stay `f64` across the board so a count like `sent` cannot flip
/// between integer and float typing from one write to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub fields: BTreeMap<String, f64>,
    pub tags: Tags,
    pub time: DateTime<Utc>,
    pub measurement: String,
}

impl DataPoint {
    /// Build a point from one summary plus the destination's tags.
    pub fn from_summary(summary: &Summary, dst_tags: Option<&Tags>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("rtt".to_string(), summary.rtt_avg);
        fields.insert("loss".to_string(), summary.loss_pct);
        fields.insert("lost".to_string(), summary.lost as f64);
        fields.insert("sent".to_string(), summary.sent as f64);

        let mut tags = Tags::new();
        tags.insert("src_ip".to_string(), summary.path.src_ip.to_string());
        tags.insert("dst_ip".to_string(), summary.path.dst_ip.to_string());
        if let Some(extra) = dst_tags {
            for (k, v) in extra {
                tags.insert(k.clone(), v.clone());
            }
        }

        Self {
            fields,
            tags,
            time: summary.ts,
            measurement: MEASUREMENT.to_string(),
        }
    }

    /// Build points for a whole summary slice, attaching each destination's
    /// TagSet entry.
    pub fn from_summaries(summaries: &[Summary], tag_set: &TagSet) -> Vec<Self> {
        summaries
            .iter()
            .map(|s| Self::from_summary(s, tag_set.get(&s.path.dst_ip.to_string())))
            .collect()
    }
}
