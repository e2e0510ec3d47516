//! Shared tracing-subscriber setup, called once by each binary — the same
//! `tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()...)`
//! shape as `src/bin/batch_test_harness.rs` in the teacher.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}
