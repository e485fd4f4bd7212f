//! Log setup and short, colour-coded id formatting.
//!
//! Log lines are emitted through `tracing`. [`init`] installs a
//! `tracing-subscriber` formatter filtered by `CONGREGATE_LOG` (default
//! `info`), e.g. `CONGREGATE_LOG=congregate=debug`.
//!
//! When writing to a terminal, ids passed through [`user_id`], [`msg_id`]
//! and [`conv_id`] get a consistent colour based on their content so the
//! same entity is easy to follow across lines.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter = EnvFilter::try_from_env("CONGREGATE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged(prefix: &str, id: &str, colour: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

/// Format a user id, e.g. `u-5f2a91c0`.
pub fn user_id(id: &str) -> String {
    tagged("u", id, hash_colour(id))
}

/// Format a conversation id, e.g. `c-6650aa01`.
pub fn conv_id(id: &str) -> String {
    tagged("c", id, hash_colour(id))
}

const MSG_ID_COLOUR: &str = "\x1b[93m"; // bright yellow

/// Format a message or notification id.
pub fn msg_id(id: &str) -> String {
    tagged("m", id, MSG_ID_COLOUR)
}
