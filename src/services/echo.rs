use async_trait::async_trait;
use dimse::{sop_class, DimseResponse, EchoHandler, RequestContext, ServiceClass};

/// Verification SOP Class provider
#[derive(Debug, Clone)]
pub struct VerificationService {
    transfer_syntaxes: Vec<String>,
}

impl VerificationService {
    pub fn new(transfer_syntaxes: Vec<String>) -> Self {
        Self { transfer_syntaxes }
    }
}

impl ServiceClass for VerificationService {
    fn sop_classes(&self) -> Vec<String> {
        vec![sop_class::VERIFICATION.to_string()]
    }

    fn transfer_syntaxes(&self) -> Vec<String> {
        self.transfer_syntaxes.clone()
    }
}

#[async_trait]
impl EchoHandler for VerificationService {
    async fn echo(&self, ctx: &RequestContext) -> DimseResponse {
        tracing::debug!(calling_ae = %ctx.calling_ae_title(), "C-ECHO");
        DimseResponse::success()
    }
}
