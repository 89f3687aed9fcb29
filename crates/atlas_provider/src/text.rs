//! Binary and text providers
//!
//! Leaf providers for standalone content fetched straight through the
//! transport: raw bytes and UTF-8 text. Text is also how catalog hash
//! siblings are fetched.

use std::sync::Arc;
use std::time::Duration;

use atlas_core::{
    FetchError, JobPoll, ProvideJob, Provider, ProviderError, ProviderId, ResourceLocation,
    ResourceValue,
};

use crate::transport::{FetchPoll, FetchRequest, TicketId, Transport};

/// Job driving a single transport fetch and mapping the bytes through a
/// conversion function.
pub(crate) struct FetchJob {
    transport: Arc<dyn Transport>,
    path: String,
    ticket: Option<TicketId>,
    convert: fn(Vec<u8>, &str) -> Result<ResourceValue, ProviderError>,
}

impl FetchJob {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        path: String,
        timeout: Option<Duration>,
        convert: fn(Vec<u8>, &str) -> Result<ResourceValue, ProviderError>,
    ) -> Self {
        let ticket = transport.begin(FetchRequest::new(path.clone()).with_timeout(timeout));
        Self {
            transport,
            path,
            ticket: Some(ticket),
            convert,
        }
    }
}

impl ProvideJob for FetchJob {
    fn poll(&mut self) -> JobPoll {
        let Some(ticket) = self.ticket else {
            return JobPoll::Failed(ProviderError::Fetch {
                path: self.path.clone(),
                source: FetchError::Read("job already finished".to_string()),
            });
        };
        match self.transport.poll(ticket) {
            FetchPoll::Pending(p) => JobPoll::Pending(p),
            FetchPoll::Done(bytes) => {
                self.ticket = None;
                match (self.convert)(bytes, &self.path) {
                    Ok(value) => JobPoll::Ready(value),
                    Err(e) => JobPoll::Failed(e),
                }
            }
            FetchPoll::Failed(source) => {
                self.ticket = None;
                JobPoll::Failed(ProviderError::Fetch {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

impl Drop for FetchJob {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            self.transport.cancel(ticket);
        }
    }
}

fn to_binary(bytes: Vec<u8>, _path: &str) -> Result<ResourceValue, ProviderError> {
    Ok(Arc::new(bytes))
}

fn to_text(bytes: Vec<u8>, path: &str) -> Result<ResourceValue, ProviderError> {
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Arc::new(text)),
        Err(e) => Err(ProviderError::Fetch {
            path: path.to_string(),
            source: FetchError::Read(format!("invalid UTF-8: {e}")),
        }),
    }
}

/// Provides raw bytes (`Vec<u8>`).
pub struct BinaryProvider {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl BinaryProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Provider for BinaryProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Binary
    }

    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        _deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        Ok(Box::new(FetchJob::new(
            self.transport.clone(),
            location.internal_id.clone(),
            self.timeout,
            to_binary,
        )))
    }
}

/// Provides UTF-8 text (`String`).
pub struct TextProvider {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl TextProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Provider for TextProvider {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Text
    }

    fn begin(
        &self,
        location: &Arc<ResourceLocation>,
        _deps: &[ResourceValue],
    ) -> Result<Box<dyn ProvideJob>, ProviderError> {
        Ok(Box::new(FetchJob::new(
            self.transport.clone(),
            location.internal_id.clone(),
            self.timeout,
            to_text,
        )))
    }
}
