//! Firmware deployment job documents.

use std::collections::BTreeMap;

use serde::Serialize;

/// Attribute carrying a device's installed firmware version.
pub const FIRMWARE_VERSION_ATTRIBUTE: &str = "firmwareVersion";

/// Document delivered to the device agent by a deployment job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDocument {
    pub operation: String,
    #[serde(rename = "jobDocument")]
    pub job_document: JobPayload,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPayload {
    #[serde(rename = "thingName")]
    pub thing_name: String,
    #[serde(rename = "attributeUpdate")]
    pub attribute_update: AttributeUpdatePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeUpdatePayload {
    pub attributes: BTreeMap<String, String>,
}

impl JobDocument {
    pub fn new(operation: &str, thing_name: &str, version: &str) -> Self {
        let attributes =
            BTreeMap::from([(FIRMWARE_VERSION_ATTRIBUTE.to_string(), version.to_string())]);
        Self {
            operation: operation.to_string(),
            job_document: JobPayload {
                thing_name: thing_name.to_string(),
                attribute_update: AttributeUpdatePayload { attributes },
            },
            version: version.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// ARN of a registered thing.
pub fn thing_arn(region: &str, account_id: &str, thing_name: &str) -> String {
    format!("arn:aws:iot:{region}:{account_id}:thing/{thing_name}")
}
