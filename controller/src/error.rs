use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TracingConfiguration {
        source: tracing::subscriber::SetGlobalDefaultError,
    },

    #[snafu(display("Error configuring metrics: '{}'", source))]
    MetricsConfiguration {
        source: opentelemetry::metrics::MetricsError,
    },

    #[snafu(display("Error running prometheus server: '{}'", source))]
    PrometheusServer { source: std::io::Error },

    #[snafu(display("Invalid configuration: '{}'", source))]
    Configuration {
        source: crate::config::error::Error,
    },
}
