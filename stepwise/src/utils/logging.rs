use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber. Safe to call more than once.
///
/// `RUST_LOG` directives are honoured; anything they leave unset logs at `info`.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env_lossy();

        // Another subscriber may already be installed by an embedding application.
        let _ = tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init();
    });
}
