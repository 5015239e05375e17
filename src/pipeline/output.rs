//! Results collected from sink nodes.

use crate::codec::Keypoint;
use crate::error::Result;
use crate::types::{ImageData, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data exported by one sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SinkOutput {
    Keypoints(Vec<Keypoint>),
    Vectors(Vec<Vector2>),
    Image(ImageData),
}

impl SinkOutput {
    pub fn as_keypoints(&self) -> Option<&[Keypoint]> {
        match self {
            SinkOutput::Keypoints(keypoints) => Some(keypoints),
            _ => None,
        }
    }

    pub fn as_vectors(&self) -> Option<&[Vector2]> {
        match self {
            SinkOutput::Vectors(vectors) => Some(vectors),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            SinkOutput::Image(image) => Some(image),
            _ => None,
        }
    }
}

/// Sink results of one run, keyed by sink name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineOutput {
    sinks: BTreeMap<String, SinkOutput>,
}

impl PipelineOutput {
    pub(crate) fn insert(&mut self, name: String, output: SinkOutput) {
        self.sinks.insert(name, output);
    }

    pub fn get(&self, sink: &str) -> Option<&SinkOutput> {
        self.sinks.get(sink)
    }

    pub fn keypoints(&self, sink: &str) -> Option<&[Keypoint]> {
        self.get(sink).and_then(SinkOutput::as_keypoints)
    }

    pub fn vectors(&self, sink: &str) -> Option<&[Vector2]> {
        self.get(sink).and_then(SinkOutput::as_vectors)
    }

    pub fn image(&self, sink: &str) -> Option<&ImageData> {
        self.get(sink).and_then(SinkOutput::as_image)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SinkOutput)> {
        self.sinks.iter().map(|(name, output)| (name.as_str(), output))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
