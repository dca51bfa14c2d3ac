use crate::collector::FetchError;
use pattoo_agent_config::{
    RegisterKind,
    RegisterVariable,
};
use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;

/// Reads holding or input registers from a Modbus TCP device.
pub trait RegisterReader: Send + Sync {
    /// Returns `register.count` values starting at `register.offset`.
    fn read<'a>(
        &'a self,
        host: &'a str,
        register: &'a RegisterVariable,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<i64>, FetchError>> + Send + 'a>>;
}

/// Reads registers with the `mbpoll` command line client.
#[derive(Debug, Clone)]
pub struct MbpollReader {
    program: Option<PathBuf>,
    port: u16,
    timeout: Duration,
}

impl MbpollReader {
    pub fn locate(timeout: Duration) -> Self {
        let program = which::which("mbpoll").ok();
        match &program {
            Some(path) => debug!(?path, "found mbpoll at"),
            None => warn!("mbpoll not found, every register read will be missing"),
        }
        Self {
            program,
            port: 502,
            timeout,
        }
    }

    fn arguments(&self, host: &str, register: &RegisterVariable) -> Vec<String> {
        let table = match register.kind {
            RegisterKind::InputRegister => "3",
            RegisterKind::HoldingRegister => "4",
        };
        let mut args = vec![
            "-m".to_string(),
            "tcp".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-t".to_string(),
            table.to_string(),
            "-0".to_string(),
            "-r".to_string(),
            register.offset.to_string(),
            "-c".to_string(),
            register.count.to_string(),
            "-o".to_string(),
            self.timeout.as_secs().max(1).to_string(),
            "-1".to_string(),
        ];
        if let Some(unit) = register.unit {
            args.extend(["-a".to_string(), unit.to_string()]);
        }
        args.push(host.to_string());
        args
    }
}

impl RegisterReader for MbpollReader {
    fn read<'a>(
        &'a self,
        host: &'a str,
        register: &'a RegisterVariable,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<i64>, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let program = self.program.as_ref().ok_or(FetchError::ToolMissing("mbpoll"))?;
            let output = Command::new(program)
                .args(self.arguments(host, register))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = format!("{} {}", stdout.trim(), stderr.trim());
                if message.contains("timed out") {
                    return Err(FetchError::Timeout(self.timeout));
                }
                return Err(FetchError::Device(message.trim().to_string()));
            }
            parse_mbpoll(register, &stdout)
        })
    }
}

/// Parses the `[offset]: value` lines `mbpoll -0 -1` prints.
pub fn parse_mbpoll(register: &RegisterVariable, output: &str) -> Result<Vec<i64>, FetchError> {
    let mut values = Vec::with_capacity(register.count as usize);
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix('[') else {
            continue;
        };
        let Some((offset, value)) = rest.split_once("]:") else {
            continue;
        };
        let offset = offset
            .trim()
            .parse::<u32>()
            .map_err(|_| FetchError::Malformed(line.to_string()))?;
        let first = register.offset as u32;
        if !(first..first + register.count as u32).contains(&offset) {
            continue;
        }
        let value = value
            .trim()
            .parse::<i64>()
            .map_err(|_| FetchError::Malformed(line.to_string()))?;
        values.push(value);
    }

    if values.len() != register.count as usize {
        return Err(FetchError::Malformed(format!(
            "expected {} values at offset {}, got {}",
            register.count,
            register.offset,
            values.len()
        )));
    }
    Ok(values)
}
