//! Backend configuration.
//!
//! Handles conversion from config-file-friendly strings (like "128K",
//! "30s") to the sizes and durations the workers consume.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Tunables for backend connections and the shared pool.
///
/// In a config file, sizes accept K/M/G suffixes and durations accept
/// ms/s/m/h suffixes:
///
/// ```toml
/// recv_bufsize = "128K"
/// send_bufsize = "128K"
/// recv_timeout = "30s"
/// send_timeout = "30s"
/// keepalive_period = "75s"
/// max_pipeline = 1024
/// number_databases = 16
/// product_auth = ""
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Receive buffer size per connection, in bytes.
    #[serde(deserialize_with = "de_byte_size")]
    pub recv_bufsize: usize,

    /// Send buffer size per connection, in bytes.
    #[serde(deserialize_with = "de_byte_size")]
    pub send_bufsize: usize,

    /// Socket read deadline per response. Zero disables the deadline.
    #[serde(deserialize_with = "de_duration")]
    pub recv_timeout: Duration,

    /// Socket write deadline per flush. Zero disables the deadline.
    #[serde(deserialize_with = "de_duration")]
    pub send_timeout: Duration,

    /// TCP keepalive period applied to dialed sockets. Zero disables it.
    #[serde(deserialize_with = "de_duration")]
    pub keepalive_period: Duration,

    /// In-flight pipeline depth per connection round.
    pub max_pipeline: usize,

    /// Databases fanned out per backend address.
    pub number_databases: usize,

    /// AUTH secret sent after dialing. `None` or empty disables auth.
    pub product_auth: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> BackendConfig {
        BackendConfig {
            recv_bufsize: 128 * 1024,
            send_bufsize: 128 * 1024,
            recv_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            keepalive_period: Duration::from_secs(75),
            max_pipeline: 1024,
            number_databases: 16,
            product_auth: None,
        }
    }
}

impl BackendConfig {
    /// The auth secret, if one is configured and non-empty.
    pub fn auth(&self) -> Option<&str> {
        match self.product_auth.as_deref() {
            Some("") | None => None,
            some => some,
        }
    }
}

// Size and duration strings are a number followed by an optional unit.
// The tables own the unit spellings; the parsers only split and look up.

const SIZE_UNITS: &[(&str, usize)] = &[
    ("k", 1 << 10),
    ("kb", 1 << 10),
    ("m", 1 << 20),
    ("mb", 1 << 20),
    ("g", 1 << 30),
    ("gb", 1 << 30),
];

const TIME_UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60 * 1_000),
    ("h", 60 * 60 * 1_000),
];

/// Splits "128K" into its digits and its unit, at the first letter.
fn split_unit(input: &str) -> (&str, &str) {
    let input = input.trim();
    let at = input
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(input.len());
    input.split_at(at)
}

/// Parses a human-readable byte size string into a number of bytes.
///
/// Supports suffixes: K/KB (kibibytes), M/MB (mebibytes), G/GB (gibibytes).
/// Plain numbers are treated as bytes. Case insensitive.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let (digits, unit) = split_unit(input);
    let unit = unit.to_ascii_lowercase();
    let factor = match unit.as_str() {
        "" => 1,
        unit => SIZE_UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
            .ok_or_else(|| format!("unknown byte size unit in '{input}'"))?,
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| format!("bad byte size '{input}'"))?;
    n.checked_mul(factor)
        .ok_or_else(|| format!("byte size '{input}' does not fit"))
}

/// Parses a human-readable duration string.
///
/// Supports suffixes: ms (milliseconds), s (seconds), m (minutes),
/// h (hours). Plain numbers are treated as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let (digits, unit) = split_unit(input);
    let unit = unit.to_ascii_lowercase();
    let unit_ms = match unit.as_str() {
        "" => 1_000,
        unit => TIME_UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, ms)| *ms)
            .ok_or_else(|| format!("unknown duration unit in '{input}'"))?,
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("bad duration '{input}'"))?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{input}' does not fit"))
}

// Serde adapters accepting either a bare number or a suffixed string.

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

fn de_byte_size<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n as usize),
        NumOrStr::Str(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(Duration::from_secs(n)),
        NumOrStr::Str(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}
