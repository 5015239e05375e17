//! Keypoint encoding through the software GPU and back

mod common;

use common::software_gpu;
use proptest::prelude::*;
use std::collections::BTreeMap;
use visionflow::codec::{
    decode, decode_lod, decode_rotation, encode_lod, encode_rotation, mark_discarded,
    KeypointEncoder, RecordLayout,
};
use visionflow::config::{EngineConfig, PyramidSettings, ReaderSettings};
use visionflow::gpu::{AsyncReader, Gpu, TextureHandle};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 12;

/// Cornerness pixel of one keypoint
#[derive(Debug, Clone, Copy)]
struct Corner {
    score: u8,
    rotation: u8,
    lod: f32,
}

impl Corner {
    fn new(score: u8, rotation: u8) -> Self {
        Self {
            score,
            rotation,
            lod: 0.0,
        }
    }
}

type Corners = BTreeMap<u32, Corner>;

/// Cornerness texture with a keypoint at each index.
fn cornerness(gpu: &Gpu, points: &Corners) -> TextureHandle {
    let pyramid = PyramidSettings::default();
    let mut pixels = vec![0u8; (WIDTH * HEIGHT * 4) as usize];
    for (&index, corner) in points {
        let i = index as usize * 4;
        let lod = encode_lod(corner.lod, &pyramid);
        pixels[i..i + 4].copy_from_slice(&[corner.score, lod, 0, corner.rotation]);
    }
    let texture = gpu.create_texture(WIDTH, HEIGHT).unwrap();
    gpu.upload(&texture, WIDTH, HEIGHT, &pixels).unwrap()
}

fn encode_to_bytes(points: &Corners, layout: RecordLayout) -> (Vec<u8>, u32) {
    let config = EngineConfig::default();
    let gpu = software_gpu();
    let mut encoder = KeypointEncoder::new(&gpu, &config.encoder).unwrap();
    let length = encoder.optimize(points.len(), layout);

    let input = cornerness(&gpu, points);
    let encoded = encoder.encode_default(&input, layout).unwrap();
    let mut reader = AsyncReader::new(&gpu, &ReaderSettings::default()).unwrap();
    let bytes = reader.read_sync(&encoded, None).unwrap().to_vec();
    (bytes, length)
}

/// Keypoints at level of detail 0
fn keypoint_map() -> impl Strategy<Value = Corners> {
    prop::collection::btree_map(
        0..WIDTH * HEIGHT,
        (1u8..=255, any::<u8>()).prop_map(|(score, rotation)| Corner::new(score, rotation)),
        0..24,
    )
}

/// Keypoints with a level of detail in `[0, log2(max_scale)]`
fn scaled_keypoint_map() -> impl Strategy<Value = Corners> {
    let max_lod = PyramidSettings::default().max_scale.log2();
    prop::collection::btree_map(
        0..WIDTH * HEIGHT,
        (1u8..=255, any::<u8>(), 0.0f32..=max_lod).prop_map(|(score, rotation, lod)| Corner {
            score,
            rotation,
            lod,
        }),
        1..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_encoded_keypoints_decode_in_raster_order(points in keypoint_map()) {
        let layout = RecordLayout::default();
        let (bytes, length) = encode_to_bytes(&points, layout);
        let decoded = decode(&bytes, layout, length, length, &EngineConfig::default().pyramid);

        prop_assert_eq!(decoded.len(), points.len());
        for (keypoint, (&index, corner)) in decoded.iter().zip(&points) {
            prop_assert_eq!(keypoint.x, (index % WIDTH) as f32);
            prop_assert_eq!(keypoint.y, (index / WIDTH) as f32);
            prop_assert_eq!(keypoint.score, corner.score as f32 / 255.0);
            prop_assert_eq!(keypoint.rotation, decode_rotation(corner.rotation));
            prop_assert_eq!(keypoint.lod, 0.0);
        }
    }

    #[test]
    fn prop_scale_survives_within_one_step(points in scaled_keypoint_map()) {
        let pyramid = PyramidSettings::default();
        let layout = RecordLayout::default();
        let (bytes, length) = encode_to_bytes(&points, layout);
        let decoded = decode(&bytes, layout, length, length, &pyramid);

        let step = (pyramid.max_scale.log2() + pyramid.max_levels as f32) / 255.0;
        prop_assert_eq!(decoded.len(), points.len());
        for (keypoint, corner) in decoded.iter().zip(points.values()) {
            let lod_byte = encode_lod(corner.lod, &pyramid);
            prop_assert_eq!(keypoint.lod, decode_lod(lod_byte, &pyramid));
            prop_assert!((keypoint.lod - corner.lod).abs() <= step);

            let expected = corner.lod.exp2();
            prop_assert!((keypoint.scale - expected).abs() <= expected * (step.exp2() - 1.0));
        }
    }

    #[test]
    fn prop_extra_bytes_widen_records(points in keypoint_map(), extra in 0usize..12) {
        let layout = RecordLayout::new(0, extra);
        let (bytes, length) = encode_to_bytes(&points, layout);
        let decoded = decode(&bytes, layout, length, length, &EngineConfig::default().pyramid);

        prop_assert_eq!(decoded.len(), points.len());
        prop_assert!(decoded.iter().all(|k| k.extra.len() == extra));
    }
}

#[test]
fn test_discarded_records_are_skipped() {
    let points: Corners = [
        (3, Corner::new(200, encode_rotation(0.5))),
        (40, Corner::new(100, 0)),
        (77, Corner::new(50, 0)),
    ]
    .into_iter()
    .collect();
    let layout = RecordLayout::default();
    let (mut bytes, length) = encode_to_bytes(&points, layout);

    assert!(mark_discarded(&mut bytes, 1, layout));
    let decoded = decode(&bytes, layout, length, length, &EngineConfig::default().pyramid);

    let positions: Vec<(f32, f32)> = decoded.iter().map(|k| (k.x, k.y)).collect();
    assert_eq!(positions, vec![(3.0, 0.0), (13.0, 4.0)]);
}

#[test]
fn test_empty_cornerness_decodes_nothing() {
    let layout = RecordLayout::default();
    let (bytes, length) = encode_to_bytes(&Corners::new(), layout);
    assert!(decode(&bytes, layout, length, length, &EngineConfig::default().pyramid).is_empty());
}
