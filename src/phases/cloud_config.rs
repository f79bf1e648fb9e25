//! Bootstrap data to remote commands.
//!
//! `#cloud-config` documents are translated for the `write_files` and
//! `runcmd` modules. Anything else is run as a shell script.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::error::SkoError;
use crate::exec::shell_quote;

pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Written once the bootstrap data ran to completion.
pub const SENTINEL_FILE: &str = "/run/cluster-api/bootstrap-success.complete";

#[derive(Debug, Default, Deserialize)]
struct CloudConfig {
    #[serde(default)]
    write_files: Vec<WriteFile>,
    #[serde(default)]
    runcmd: Vec<RunCmd>,
}

#[derive(Debug, Deserialize)]
struct WriteFile {
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RunCmd {
    Line(String),
    Argv(Vec<String>),
}

pub fn sentinel_check_command() -> String {
    format!("if [ -f {SENTINEL_FILE} ]; then echo 'exists'; fi")
}

pub fn sentinel_write_command() -> String {
    let dir = Path::new(SENTINEL_FILE)
        .parent()
        .map_or_else(|| "/run".to_string(), |p| p.display().to_string());
    format!("mkdir -p {dir} && echo success > {SENTINEL_FILE}")
}

/// Commands that apply `data` on the host, in order.
pub fn to_commands(data: &str) -> Result<Vec<String>, SkoError> {
    if !data.trim_start().starts_with(CLOUD_CONFIG_HEADER) {
        return Ok(vec![data.to_string()]);
    }

    let config: Option<CloudConfig> = serde_yaml::from_str(data)
        .map_err(|e| SkoError::InvalidConfiguration(format!("invalid cloud-config: {e}")))?;
    let config = config.unwrap_or_default();

    let mut commands = Vec::new();
    for file in &config.write_files {
        commands.extend(write_file_commands(file)?);
    }
    for cmd in &config.runcmd {
        commands.push(match cmd {
            RunCmd::Line(line) => line.clone(),
            RunCmd::Argv(argv) => argv
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        });
    }
    Ok(commands)
}

fn write_file_commands(file: &WriteFile) -> Result<Vec<String>, SkoError> {
    let content = decode_content(file)?;
    let path = shell_quote(&file.path);
    let mut commands = Vec::new();

    if let Some(dir) = Path::new(&file.path).parent()
        && !dir.as_os_str().is_empty()
    {
        commands.push(format!("mkdir -p {}", shell_quote(&dir.display().to_string())));
    }
    let redirect = if file.append { ">>" } else { ">" };
    commands.push(format!(
        "printf '%s' {} {redirect} {path}",
        shell_quote(&content)
    ));
    if let Some(permissions) = file.permissions.as_deref() {
        commands.push(format!("chmod {} {path}", shell_quote(permissions)));
    }
    if let Some(owner) = file.owner.as_deref() {
        commands.push(format!("chown {} {path}", shell_quote(owner)));
    }
    Ok(commands)
}

fn decode_content(file: &WriteFile) -> Result<String, SkoError> {
    match file.encoding.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("" | "text/plain") => Ok(file.content.clone()),
        Some("base64" | "b64") => {
            let bytes = STANDARD
                .decode(file.content.trim())
                .map_err(|e| invalid_file(file, &format!("bad base64 content: {e}")))?;
            String::from_utf8(bytes).map_err(|_| invalid_file(file, "content is not UTF-8"))
        }
        Some(other) => Err(invalid_file(file, &format!("unsupported encoding {other}"))),
    }
}

fn invalid_file(file: &WriteFile, message: &str) -> SkoError {
    SkoError::InvalidConfiguration(format!("write_files {}: {message}", file.path))
}
