//! Test data builders for synthetic images and standard pipelines

use visionflow::config::EngineConfig;
use visionflow::gpu::Gpu;
use visionflow::pipeline::{
    CornerDetectorNode, GreyscaleNode, ImageFeed, ImageSourceNode, KeypointSinkNode, Node,
    PipelineGraph,
};
use visionflow::types::ImageData;

/// Builder for black and white checkerboard images
pub struct CheckerboardBuilder {
    width: u32,
    height: u32,
    cell: u32,
    dark: [u8; 3],
    light: [u8; 3],
}

impl CheckerboardBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cell: 3,
            dark: [0, 0, 0],
            light: [255, 255, 255],
        }
    }

    pub fn cell(mut self, cell: u32) -> Self {
        self.cell = cell;
        self
    }

    /// Colour of the light cells
    pub fn light(mut self, rgb: [u8; 3]) -> Self {
        self.light = rgb;
        self
    }

    /// Inner cell crossings in raster order; these are the pixels with a
    /// non-zero 2×2 cross-difference response.
    pub fn corners(&self) -> Vec<(u32, u32)> {
        let mut corners = Vec::new();
        for y in (self.cell..self.height).step_by(self.cell as usize) {
            for x in (self.cell..self.width).step_by(self.cell as usize) {
                corners.push((x, y));
            }
        }
        corners
    }

    pub fn build(self) -> ImageData {
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                let light = ((x / self.cell) + (y / self.cell)) % 2 == 0;
                let [r, g, b] = if light { self.light } else { self.dark };
                pixels.extend_from_slice(&[r, g, b, 255]);
            }
        }
        ImageData::from_rgba(self.width, self.height, pixels).expect("valid checkerboard")
    }
}

/// Source → greyscale → [spliced node] → corner detector → keypoint sink
pub struct DetectionPipeline {
    pub graph: PipelineGraph,
    pub feed: ImageFeed,
}

/// Builder for [`DetectionPipeline`]
pub struct DetectionPipelineBuilder {
    config: EngineConfig,
    turbo: bool,
    capacity: usize,
    threshold: f32,
    spliced: Option<Box<dyn Node>>,
}

impl DetectionPipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            turbo: false,
            capacity: 16,
            threshold: 0.1,
            spliced: None,
        }
    }

    /// Image-to-image node run between the greyscale and corner stages
    pub fn splice(mut self, node: impl Node + 'static) -> Self {
        self.spliced = Some(Box::new(node));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn turbo(mut self, turbo: bool) -> Self {
        self.turbo = turbo;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn build(self, gpu: &Gpu) -> DetectionPipeline {
        let (source, feed) = ImageSourceNode::new("image");
        let nodes: Vec<Box<dyn Node>> = vec![
            Box::new(source),
            Box::new(GreyscaleNode::new("greyscale")),
            Box::new(
                CornerDetectorNode::new("corners")
                    .with_threshold(self.threshold)
                    .with_capacity(self.capacity)
                    .with_encoder_settings(self.config.encoder.clone()),
            ),
            Box::new(
                KeypointSinkNode::new("keypoints")
                    .with_config(&self.config)
                    .turbo(self.turbo),
            ),
        ];

        let mut graph = PipelineGraph::new(gpu);
        graph.init(nodes).expect("nodes initialize");
        graph.link("image", "greyscale").expect("link");
        match self.spliced {
            Some(node) => {
                let name = node.name().to_string();
                graph.add_node(node).expect("spliced node initializes");
                graph.link("greyscale", &name).expect("link");
                graph.link(&name, "corners").expect("link");
            }
            None => {
                graph.link("greyscale", "corners").expect("link");
            }
        }
        graph.link("corners", "keypoints").expect("link");
        DetectionPipeline { graph, feed }
    }
}

impl Default for DetectionPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_builder() {
        let builder = CheckerboardBuilder::new(8, 8);
        assert_eq!(builder.corners(), vec![(3, 3), (6, 3), (3, 6), (6, 6)]);

        let image = builder.build();
        assert_eq!(image.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(image.pixel(3, 0), Some([0, 0, 0, 255]));
        assert_eq!(image.pixel(3, 3), Some([255, 255, 255, 255]));
    }
}
