//! Trivy JSON report types.

use serde::{Deserialize, Deserializer, Serialize};

/// Scan results for one target (an OS layer or a language lockfile) inside
/// an image.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrivyResponse {
    pub target: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vulnerabilities: Vec<TrivyVulnerability>,
}

/// One finding.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    pub vulnerability_id: String,
    pub pkg_name: String,
    pub installed_version: String,
    #[serde(default)]
    pub fixed_version: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: Vec<String>,
}

/// Report layout of trivy releases that wrap results in an object.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Report {
    #[serde(default, deserialize_with = "null_as_default")]
    results: Vec<TrivyResponse>,
}

/// Decodes trivy's JSON output. Accepts both the bare array of results and
/// the `{"Results": [...]}` object. A bare `null` means no results.
pub fn parse_report(output: &[u8]) -> Result<Vec<TrivyResponse>, serde_json::Error> {
    match output.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') => serde_json::from_slice::<Report>(output).map(|report| report.results),
        _ => serde_json::from_slice::<Option<Vec<TrivyResponse>>>(output)
            .map(Option::unwrap_or_default),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
