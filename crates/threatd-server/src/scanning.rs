//! Scanning and metadata-rescan sockets.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use threatd_protocol::{MetadataRescanRequest, ScanRequest};

use crate::engine::ScanEngineFactory;
use crate::socket::{ConnectionHandler, serve_requests};

/// Answers [`ScanRequest`]s with the engine's verdict.
pub struct ScanningHandler {
    engine: Arc<dyn ScanEngineFactory>,
}

impl ScanningHandler {
    pub fn new(engine: Arc<dyn ScanEngineFactory>) -> Self {
        Self { engine }
    }
}

impl ConnectionHandler for ScanningHandler {
    fn handle(&self, stream: UnixStream) {
        serve_requests("scanning", &stream, |request: ScanRequest| {
            self.engine.scan(&request)
        });
    }
}

/// Answers [`MetadataRescanRequest`]s.
pub struct MetadataRescanHandler {
    engine: Arc<dyn ScanEngineFactory>,
}

impl MetadataRescanHandler {
    pub fn new(engine: Arc<dyn ScanEngineFactory>) -> Self {
        Self { engine }
    }
}

impl ConnectionHandler for MetadataRescanHandler {
    fn handle(&self, stream: UnixStream) {
        serve_requests("metadata-rescan", &stream, |request: MetadataRescanRequest| {
            self.engine.rescan_metadata(&request)
        });
    }
}
