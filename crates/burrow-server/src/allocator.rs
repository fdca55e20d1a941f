//! Random-but-friendly subdomain names and public TCP port selection.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;

use burrow_core::{TunnelError, TunnelResult};

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "calm", "clever", "crisp", "eager", "fancy", "fuzzy", "gentle",
    "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "proud", "quiet", "rapid",
    "shiny", "sunny", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "falcon", "fjord", "garnet", "glacier",
    "harbor", "heron", "lagoon", "lantern", "maple", "meadow", "otter", "pebble", "pine",
    "raven", "reef", "river", "summit", "tundra", "willow",
];

/// How many adjective-noun-number draws to try before falling back to a
/// random suffix.
const SUBDOMAIN_ATTEMPTS: usize = 16;

/// How many random port draws to try before reporting exhaustion.
const PORT_ATTEMPTS: usize = 32;

/// Allocate a friendly `adjective-noun-number` subdomain not matched by
/// `taken`. After bounded collision retries the name degrades to a longer
/// random suffix, which makes a collision with a live tunnel vanishingly
/// unlikely.
pub fn random_subdomain(taken: impl Fn(&str) -> bool) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..SUBDOMAIN_ATTEMPTS {
        let candidate = format!(
            "{}-{}-{}",
            ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
            NOUNS[rng.gen_range(0..NOUNS.len())],
            rng.gen_range(0..1000u16),
        );
        if !taken(&candidate) {
            return candidate;
        }
    }

    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("tunnel-{suffix}")
}

/// Draw an unused port uniformly from `[min, max]`, excluding `used`.
///
/// Callers still race with the OS on `bind()`; they should put the port back
/// through here (with the failed port marked used) a bounded number of times.
pub fn random_port(min: u16, max: u16, used: &HashSet<u16>) -> TunnelResult<u16> {
    let span = (max - min) as u32 + 1;
    if used.len() as u32 >= span {
        return Err(TunnelError::PortExhausted(min, max));
    }
    let mut rng = rand::thread_rng();
    for _ in 0..PORT_ATTEMPTS {
        let candidate = rng.gen_range(min..=max);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }
    // Dense ranges can defeat random draws; fall back to a linear scan.
    (min..=max)
        .find(|p| !used.contains(p))
        .ok_or(TunnelError::PortExhausted(min, max))
}
