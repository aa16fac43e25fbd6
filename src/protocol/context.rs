use crate::error::DecodeError;
use crate::sink::{Anomaly, AnomalyKind, DataSource, FieldRecord, FieldValue, Severity, Sink};
use std::borrow::Cow;

/// Per-message decode state: where offsets point and where records go.
///
/// Nothing here outlives one [`decode_message`](super::decode_message) call.
pub struct DecodeContext<'s> {
    sink: &'s mut dyn Sink,
    source: DataSource,
    base: u64,
    anomalies: Vec<Anomaly>,
}

impl<'s> DecodeContext<'s> {
    /// `base` is the stream offset of byte 0 of the buffer being decoded.
    pub fn new(sink: &'s mut dyn Sink, base: u64) -> Self {
        Self {
            sink,
            source: DataSource::Wire,
            base,
            anomalies: Vec::new(),
        }
    }

    pub fn field(
        &mut self,
        field: impl Into<Cow<'static, str>>,
        offset: usize,
        len: usize,
        value: FieldValue,
    ) {
        self.sink.field(FieldRecord {
            field: field.into(),
            source: self.source,
            offset: self.base + offset as u64,
            len,
            value,
        });
    }

    pub fn anomaly(
        &mut self,
        severity: Severity,
        kind: AnomalyKind,
        offset: usize,
        message: impl Into<String>,
    ) {
        let anomaly = Anomaly {
            severity,
            kind,
            message: message.into(),
            source: self.source,
            offset: self.base + offset as u64,
        };
        self.sink.anomaly(&anomaly);
        self.anomalies.push(anomaly);
    }

    pub fn decode_error(&mut self, err: &DecodeError) {
        let kind = match err {
            DecodeError::MalformedCollectionName { .. } => AnomalyKind::MalformedCollectionName,
            DecodeError::BadSectionSize { .. } | DecodeError::NegativeLength { .. } => {
                AnomalyKind::BadLength
            }
            DecodeError::Truncated { .. } | DecodeError::UnterminatedString { .. } => {
                AnomalyKind::Truncated
            }
        };
        self.anomaly(Severity::Error, kind, err.offset(), err.to_string());
    }

    /// Run `f` with offsets relative to a freshly decompressed buffer.
    pub fn with_decompressed<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = (self.source, self.base);
        self.source = DataSource::Decompressed;
        self.base = 0;
        let out = f(self);
        (self.source, self.base) = saved;
        out
    }

    pub fn into_anomalies(self) -> Vec<Anomaly> {
        self.anomalies
    }
}
