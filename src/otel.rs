// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers: the builder injects the
//! current context into every outgoing envelope, and the receive pipeline
//! extracts it to parent the consumer span of each delivery.

use crate::broker::{HeaderValue, Headers};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeadersTracePropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeadersTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the current trace context into `headers`.
pub(crate) fn inject_context(headers: &mut Headers) {
    let ctx = Context::current();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeadersTracePropagator::new(headers))
    });
}

/// Creates the consumer span of a delivery, parented by the context carried
/// in its headers.
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeadersTracePropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(headers.get("traceparent"), Some(&HeaderValue::from("00-abc")));
    }

    #[test]
    fn extractor_only_reads_string_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), HeaderValue::from("00-abc"));
        headers.insert("MessageType".to_owned(), HeaderValue::Int(1));
        let propagator = HeadersTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.get("MessageType"), None);
        assert_eq!(propagator.keys().len(), 2);
    }
}
