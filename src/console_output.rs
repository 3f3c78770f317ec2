use colored::Colorize;
use term_size::*;

/// End-of-run totals shown to the operator.
#[derive(Default, Debug, Clone, Copy)]
pub struct MigStats {
    /// objects known to the digest
    pub objects: u64,
    /// objects completed overall
    pub done_objects: u64,
    /// bytes known to the digest
    pub bytes: u64,
    /// bytes completed overall
    pub done_bytes: u64,
    /// objects completed during this session
    pub session_objects: u64,
    /// bytes completed during this session
    pub session_bytes: u64,
    /// objects that exhausted their retries
    pub failures: u64,
    /// wall-clock duration of the session in seconds
    pub seconds: u64,
}

// Trait for reporting migration progress to the operator
pub trait ProgressInfo {
    /// A migration has begun from `source` to `destination`
    #[allow(unused_variables)]
    fn start(&self, source: &str, destination: &str) {}

    /// The migration ended; totals are in the stats struct
    #[allow(unused_variables)]
    fn end(&self, stats: &MigStats) {}
}

pub struct ConsoleProgressOutput {}

impl ConsoleProgressOutput {
    pub fn new() -> ConsoleProgressOutput {
        ConsoleProgressOutput {}
    }
}

impl ProgressInfo for ConsoleProgressOutput {
    fn start(&self, source: &str, destination: &str) {
        println!(
            "{} Migrating from {} to {} …",
            "::".color("blue"),
            source.bold(),
            destination.bold()
        )
    }

    fn end(&self, stats: &MigStats) {
        println!("{}", "-".repeat(get_terminal_width()));
        if stats.failures == 0 {
            println!(
                "{} Migrated {}/{} objects ({}/{})",
                " ✓".color("green"),
                stats.done_objects,
                stats.objects,
                human_bytes(stats.done_bytes),
                human_bytes(stats.bytes),
            );
        } else {
            println!(
                "{} {} objects permanently failed; {}/{} migrated",
                " ✗".color("red"),
                stats.failures,
                stats.done_objects,
                stats.objects,
            );
        }
        let rate = if stats.seconds == 0 {
            stats.session_bytes
        } else {
            stats.session_bytes / stats.seconds
        };
        println!(
            "{} objects and {} moved this session, {}/s over {}",
            stats.session_objects,
            human_bytes(stats.session_bytes),
            human_bytes(rate),
            human_seconds(stats.seconds as usize),
        );
    }
}

fn get_terminal_width() -> usize {
    if let Some((w, _)) = dimensions() {
        return w;
    }
    //otherwise default to like, 80 characters
    80
}

fn human_seconds(s: usize) -> String {
    let hours = s / 3600;
    let minutes = (s / 60) % 60;
    let seconds = s % 60;
    return format!("{:02}:{:02}:{:02}", hours, minutes, seconds);
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", n, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[test]
fn test_human_bytes() {
    assert_eq!(human_bytes(512), "512 B");
    assert_eq!(human_bytes(2048), "2.0 KiB");
    assert_eq!(human_bytes(1048586), "1.0 MiB");
}

#[test]
fn test_human_seconds() {
    assert_eq!(human_seconds(0), "00:00:00");
    assert_eq!(human_seconds(3661), "01:01:01");
}
