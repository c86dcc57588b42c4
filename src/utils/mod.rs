//! Utility helpers shared by the probes

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric string of exactly `length` characters
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Random topic with `levels` levels of five characters each
pub fn random_topic(levels: usize) -> String {
    (0..levels)
        .map(|_| random_string(5))
        .collect::<Vec<_>>()
        .join("/")
}

/// Random payload of exactly `length` bytes
pub fn random_payload(length: usize) -> Vec<u8> {
    random_string(length).into_bytes()
}
