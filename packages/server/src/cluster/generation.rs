//! Heartbeat generation seeding.
//!
//! The generation is wall-clock seconds at boot, which is monotonic across
//! restarts as long as restarts take longer than a second. The optional
//! floor file closes that gap: the last used generation is persisted, and a
//! restart within the same clock-second resumes at `floor + 1`.
//!
//! Floor I/O failures are never fatal -- the clock value is used and the
//! problem is logged. A corrupt or unwritable floor file can delay gossip
//! convergence after a rapid restart, but cannot stop the node.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::traits::ClockSource;

#[derive(Debug, Serialize, Deserialize)]
struct GenerationFloor {
    generation: u64,
}

/// Computes the generation for a new incarnation and advances the floor.
#[must_use]
pub fn next_generation(clock: &dyn ClockSource, floor_path: Option<&Path>) -> u64 {
    let from_clock = clock.wall_secs();
    let Some(path) = floor_path else {
        return from_clock;
    };

    let floor = read_floor(path);
    let generation = match floor {
        Some(previous) => from_clock.max(previous + 1),
        None => from_clock,
    };

    if let Err(error) = write_floor(path, generation) {
        tracing::warn!(path = %path.display(), %error, "failed to persist generation floor");
    }
    generation
}

fn read_floor(path: &Path) -> Option<u64> {
    let raw = fs::read(path).ok()?;
    match serde_json::from_slice::<GenerationFloor>(&raw) {
        Ok(floor) => Some(floor.generation),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring corrupt generation floor");
            None
        }
    }
}

fn write_floor(path: &Path, generation: u64) -> std::io::Result<()> {
    let body = serde_json::to_vec(&GenerationFloor { generation })
        .expect("floor struct always serializes");
    fs::write(path, body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
