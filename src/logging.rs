//! Tracing setup for the binary.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_ONCE: Once = Once::new();

/// Install the stderr subscriber. `RUST_LOG` wins over `verbosity`.
pub fn init(verbosity: u8) {
    INIT_ONCE.call_once(|| {
        let default = match verbosity {
            0 => "good_night_bar=warn",
            1 => "good_night_bar=info",
            2 => "good_night_bar=debug",
            _ => "good_night_bar=trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
            )
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(0);
        init(3);
    }
}
