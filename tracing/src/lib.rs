//! Shared tracing-subscriber setup for the longshore binaries: an
//! EnvFilter-driven compact stderr layer plus an indicatif layer so spans
//! annotated with `indicatif.pb_show` render progress bars.

use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, IndicatifLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PB_PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{bar:30} {wide_msg} [{elapsed_precise}]  {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
    pub static ref PB_SPINNER_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} [{elapsed_precise}]"
    )
    .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Default)]
pub struct TracingBuilder {
    level: Option<Level>,
}

impl TracingBuilder {
    /// Set the default log level for all layers. `RUST_LOG` still has a
    /// higher priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = Some(level);
        self
    }

    /// Install the subscriber: a compact stderr writer routed through the
    /// indicatif layer (so log lines don't tear progress bars), filtered
    /// by the configured level unless `RUST_LOG` overrides it.
    pub fn build(self) -> Result<(), Error> {
        let level = self.level.unwrap_or(Level::INFO);
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());

        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            )
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .compact(),
            )
            .with(indicatif_layer.with_filter(
                // only show progress for spans with indicatif.pb_show field being set
                IndicatifFilter::new(false),
            ))
            .try_init()?;

        Ok(())
    }
}
