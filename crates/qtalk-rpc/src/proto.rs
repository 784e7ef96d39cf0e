//! Header values exchanged at the start of each RPC.

use serde::{Deserialize, Serialize};

/// The first framed value on any RPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHeader {
    #[serde(rename = "Selector")]
    pub selector: String,
}

/// The first framed value in a reply.
///
/// When `continue` is set the channel stays open after the reply values and
/// control passes to the application for arbitrary further framed exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(rename = "Error")]
    pub error: Option<String>,
    #[serde(rename = "Continue", default)]
    pub continue_: bool,
}
