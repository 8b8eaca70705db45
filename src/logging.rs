//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Filter directive for the given CLI flags. `-q` wins over `-v`.
pub fn level_for(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn,vocalink=info",
        1 => "info,vocalink=debug",
        _ => "debug,vocalink=trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the flags.
///
/// Logs go to stderr so stdout stays free for conversation output.
pub fn init(quiet: bool, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(quiet, verbose)));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .try_init()
        .is_err()
    {
        // Subscriber already installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_overrides_verbose() {
        assert_eq!(level_for(true, 2), "error");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for(false, 0), "warn,vocalink=info");
        assert_eq!(level_for(false, 1), "info,vocalink=debug");
        assert_eq!(level_for(false, 5), "debug,vocalink=trace");
    }

    #[test]
    fn test_directives_parse() {
        for verbose in 0..3 {
            assert!(EnvFilter::try_new(level_for(false, verbose)).is_ok());
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(true, 0);
        init(false, 1);
    }
}
