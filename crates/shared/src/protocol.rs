//! Wire types for the access API used during email verification and registration.

use serde::{Deserialize, Serialize};

use crate::domain::Did;

pub const AGENT_DID_HEADER: &str = "x-agent-did";
pub const AGENT_SIGNATURE_HEADER: &str = "x-agent-signature";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateEmailRequest {
    pub did: Did,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateEmailQuery {
    pub did: Did,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub did: Did,
    pub email: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub stored_blocks: usize,
}
