// Schema of the mocha JSON reporter, as produced inside the execution environment.
// Every field defaults so partial reports still decode.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportStats {
    pub suites: u32,
    pub tests: u32,
    pub passes: u32,
    pub pending: u32,
    pub failures: u32,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportError {
    pub message: String,
    pub stack: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportTest {
    pub title: String,
    pub full_title: String,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub state: Option<String>,
    pub err: Option<ReportError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredTestReport {
    pub stats: ReportStats,
    pub tests: Vec<ReportTest>,
    pub passes: Vec<ReportTest>,
    pub failures: Vec<ReportTest>,
    pub pending: Vec<ReportTest>,
}
