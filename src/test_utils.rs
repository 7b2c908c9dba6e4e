//! Shared fixtures for unit tests.

use crate::config::{
    PairConfig, PairStatus, RelayConfig, SessionConfig, SessionStatus, StripRules,
};
use std::collections::HashMap;

/// Minimal valid config: one pair (`p1`, owned by alice, `@source` ->
/// `@dest`) and one session (`s1`).
pub fn sample_config() -> RelayConfig {
    let mut credentials = HashMap::new();
    credentials.insert("main".to_string(), "tok-test".to_string());
    RelayConfig {
        pairs: vec![PairConfig {
            id: "p1".into(),
            owner: "alice".into(),
            source_channel: "@source".into(),
            destinations: vec!["@dest".into()],
            credential: "main".into(),
            strip_rules: StripRules::default(),
            status: PairStatus::Active,
        }],
        sessions: vec![SessionConfig {
            id: "s1".into(),
            owner: "alice".into(),
            subscriptions: Vec::new(),
            status: SessionStatus::Active,
        }],
        blocklist: Vec::new(),
        limits: Default::default(),
        credentials,
    }
}

/// A solid-color PNG for image trap tests.
pub fn test_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}
