use actix_web::{get, web::Data, HttpResponse};
use prometheus::{Encoder, Registry, TextEncoder};

#[get("/metrics")]
pub async fn vending_metrics(registry: Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families[..], &mut buf) {
        opentelemetry::global::handle_error(opentelemetry::metrics::MetricsError::Other(
            err.to_string(),
        ));
    }

    let body = String::from_utf8(buf).unwrap_or_default();
    HttpResponse::Ok()
        .insert_header((http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT))
        .body(body)
}
