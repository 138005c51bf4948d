// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Trace context travels in the message headers next to the control headers.
//! Publishing injects the current context; consuming extracts it and opens a
//! consumer span named after the handler.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Tracer name used by consumers
pub(crate) const CONSUMER_TRACER: &str = "rabbitmq-jobs consumer";

/// Adapter between OpenTelemetry propagators and AMQP header tables.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Adds the trace context of `ctx` to a header table.
pub(crate) fn inject(ctx: &Context, headers: FieldTable) -> FieldTable {
    let mut btree = headers.inner().clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut btree))
    });

    FieldTable::from(btree)
}

/// Properties with the current trace context added to their headers.
pub(crate) fn with_trace_context(ctx: &Context, props: BasicProperties) -> BasicProperties {
    let headers = props.headers().clone().unwrap_or_default();
    props.with_headers(inject(ctx, headers))
}

/// Opens a consumer span for a delivery, parented by the context its
/// headers carry.
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
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
        let mut btree = BTreeMap::new();
        HeaderPropagator::new(&mut btree).set("TraceParent", "00-abc".to_owned());

        let propagator = HeaderPropagator::new(&mut btree);
        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn inject_keeps_existing_headers() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("x-attempts"), AMQPValue::LongLongInt(2));

        let table = inject(&Context::new(), FieldTable::from(btree));

        assert_eq!(
            table.inner().get("x-attempts"),
            Some(&AMQPValue::LongLongInt(2))
        );
    }
}
