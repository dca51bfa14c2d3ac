use crate::{
    collector::FetchError,
    metrics::{
        DataType,
        MetricValue,
        SubKey,
    },
};
use pattoo_agent_config::SnmpAuthGroup;
use std::{
    fs::OpenOptions,
    future::Future,
    io::{
        self,
        Write as _,
    },
    os::unix::fs::OpenOptionsExt as _,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    time::Duration,
};
use temp_dir::TempDir;
use tokio::process::Command;

/// One value returned by a walk.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkValue {
    pub sub_key: SubKey,
    pub value: MetricValue,
    pub data_type: DataType,
}

/// Something that can walk an OID subtree on a device.
pub trait SnmpSession: Send + Sync {
    fn walk<'a>(
        &'a self,
        host: &'a str,
        auth: &'a SnmpAuthGroup,
        oid: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WalkValue>, FetchError>> + Send + 'a>>;
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Walks through the net-snmp command line tools.
#[derive(Debug, Clone)]
pub struct NetSnmpSession {
    bulkwalk: Option<PathBuf>,
    walk: Option<PathBuf>,
    timeout: Duration,
}

impl NetSnmpSession {
    /// Looks the tools up on `PATH`. Missing tools are reported on every walk.
    pub fn locate(timeout: Duration) -> Self {
        let find = |name: &str| match which::which(name) {
            Ok(path) => {
                debug!(?path, "found {} at", name);
                Some(path)
            }
            Err(_) => {
                warn!("{name} not found, SNMP walks relying on it will be missing");
                None
            }
        };
        Self {
            bulkwalk: find("snmpbulkwalk"),
            walk: find("snmpwalk"),
            timeout,
        }
    }

    fn program(&self, version: u8) -> Result<&PathBuf, FetchError> {
        // GETBULK does not exist in SNMPv1
        let preferred = if version == 1 { None } else { self.bulkwalk.as_ref() };
        preferred
            .or(self.walk.as_ref())
            .ok_or(FetchError::ToolMissing("snmpwalk"))
    }

    fn arguments(&self, host: &str, auth: &SnmpAuthGroup, oid: &str) -> Vec<String> {
        let mut args = vec![
            "-On".to_string(),
            "-Oe".to_string(),
            "-t".to_string(),
            self.timeout.as_secs().max(1).to_string(),
            "-r".to_string(),
            "0".to_string(),
        ];
        match auth.snmp_version {
            3 => {
                args.extend(["-v".to_string(), "3".to_string()]);
                if let Some(secname) = &auth.snmp_secname {
                    args.extend(["-u".to_string(), secname.clone()]);
                }
                let level = match (&auth.snmp_authpassword, &auth.snmp_privpassword) {
                    (Some(_), Some(_)) => "authPriv",
                    (Some(_), None) => "authNoPriv",
                    _ => "noAuthNoPriv",
                };
                args.extend(["-l".to_string(), level.to_string()]);
                // passphrases go through `v3_passphrases`, never argv
                if auth.snmp_authpassword.is_some() {
                    let protocol = auth.snmp_authprotocol.as_deref().unwrap_or("SHA");
                    args.extend(["-a".to_string(), protocol.to_uppercase()]);
                }
                if auth.snmp_privpassword.is_some() {
                    let protocol = auth.snmp_privprotocol.as_deref().unwrap_or("AES");
                    args.extend(["-x".to_string(), protocol.to_uppercase()]);
                }
            }
            version => {
                let version = if version == 1 { "1" } else { "2c" };
                let community = auth.snmp_community.as_deref().unwrap_or("public");
                args.extend([
                    "-v".to_string(),
                    version.to_string(),
                    "-c".to_string(),
                    community.to_string(),
                ]);
            }
        }
        args.push(format!("{host}:{}", auth.snmp_port));
        args.push(oid.to_string());
        args
    }
}

/// `snmp.conf` lines with the SNMPv3 passphrases of `auth`, if it has any.
fn v3_passphrases(auth: &SnmpAuthGroup) -> Option<String> {
    if auth.snmp_version != 3 {
        return None;
    }
    let lines = [
        ("defAuthPassphrase", &auth.snmp_authpassword),
        ("defPrivPassphrase", &auth.snmp_privpassword),
    ]
    .into_iter()
    .filter_map(|(token, password)| password.as_deref().map(|password| format!("{token} {}\n", quote(password))))
    .collect::<String>();
    (!lines.is_empty()).then_some(lines)
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Writes `conf` to an owner-only `snmp.conf` in a fresh directory, meant for
/// `SNMPCONFPATH`. The directory is removed when dropped.
fn private_conf(conf: &str) -> io::Result<TempDir> {
    let dir = TempDir::with_prefix("pattoo-agent-snmp")?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dir.child("snmp.conf"))?;
    file.write_all(conf.as_bytes())?;
    Ok(dir)
}

impl SnmpSession for NetSnmpSession {
    fn walk<'a>(
        &'a self,
        host: &'a str,
        auth: &'a SnmpAuthGroup,
        oid: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WalkValue>, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let program = self.program(auth.snmp_version)?;
            let secrets = v3_passphrases(auth).map(|conf| private_conf(&conf)).transpose()?;

            let mut command = Command::new(program);
            command
                .args(self.arguments(host, auth, oid))
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = &secrets {
                command.env("SNMPCONFPATH", dir.path());
            }
            let output = command.output().await?;
            drop(secrets);

            let stdout = String::from_utf8_lossy(&output.stdout);
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("Timeout") {
                    return Err(FetchError::Timeout(self.timeout));
                }
                return Err(FetchError::Device(stderr.trim().to_string()));
            }
            parse_walk(oid, &stdout)
        })
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Parses `snmpwalk -On` output of a walk rooted at `root`.
pub fn parse_walk(root: &str, output: &str) -> Result<Vec<WalkValue>, FetchError> {
    let root = normalize_oid(root);
    let mut values: Vec<WalkValue> = Vec::new();
    let mut unsupported = false;

    for line in output.lines() {
        let Some((oid, rest)) = line.split_once(" = ") else {
            // continuation of a multi line string
            if let Some(WalkValue {
                value: MetricValue::Text(text),
                ..
            }) = values.last_mut()
            {
                text.push('\n');
                text.push_str(line.trim_end_matches('"'));
            }
            continue;
        };

        let rest = rest.trim();
        if rest.starts_with("No Such Object") || rest.starts_with("No Such Instance") {
            unsupported = true;
            continue;
        }
        if rest.starts_with("No more variables") || rest.starts_with("End of MIB") {
            continue;
        }

        let oid = normalize_oid(oid.trim());
        let suffix = oid
            .strip_prefix(&root)
            .filter(|suffix| suffix.is_empty() || suffix.starts_with('.'));
        let Some(suffix) = suffix else {
            continue;
        };
        let sub_key = sub_key_from_suffix(suffix);

        let (kind, raw) = match rest.split_once(": ") {
            Some((kind, raw)) => (kind, raw),
            None => (rest.strip_suffix(':').unwrap_or(""), if rest.ends_with(':') { "" } else { rest }),
        };
        let (value, data_type) = parse_typed_value(kind, raw)?;
        values.push(WalkValue {
            sub_key,
            value,
            data_type,
        });
    }

    if values.is_empty() && unsupported {
        return Err(FetchError::Unsupported(root));
    }
    Ok(values)
}

fn normalize_oid(oid: &str) -> String {
    let trimmed = oid.trim_end_matches('.');
    if trimmed.starts_with('.') {
        trimmed.to_string()
    } else {
        format!(".{trimmed}")
    }
}

fn sub_key_from_suffix(suffix: &str) -> SubKey {
    let suffix = suffix.trim_start_matches('.');
    if suffix.is_empty() {
        return SubKey::Index(0);
    }
    match suffix.parse::<i64>() {
        Ok(index) => SubKey::Index(index),
        Err(_) => SubKey::Name(suffix.to_string()),
    }
}

fn parse_typed_value(kind: &str, raw: &str) -> Result<(MetricValue, DataType), FetchError> {
    let raw = raw.trim();
    let numeric = |raw: &str| -> Result<MetricValue, FetchError> {
        // enumerations print as `up(1)` and timeticks as `(123) 0:00:01.23`
        let number = match (raw.find('('), raw.find(')')) {
            (Some(open), Some(close)) if open < close => &raw[open + 1..close],
            _ => raw.split_whitespace().next().unwrap_or(raw),
        };
        if let Ok(value) = number.parse::<u64>() {
            Ok(MetricValue::Unsigned(value))
        } else if let Ok(value) = number.parse::<i64>() {
            Ok(MetricValue::Signed(value))
        } else {
            Err(FetchError::Malformed(format!("{raw:?} is not a number")))
        }
    };

    match kind {
        "Counter32" | "Counter64" => Ok((numeric(raw)?, DataType::Counter)),
        "Gauge32" | "INTEGER" | "Unsigned32" | "Timeticks" | "UInteger32" => Ok((numeric(raw)?, DataType::Gauge)),
        "Opaque" => match raw.rsplit_once(": ") {
            Some((_, number)) => match number.parse::<f64>() {
                Ok(value) => Ok((MetricValue::Float(value), DataType::Gauge)),
                Err(_) => Ok((MetricValue::Text(raw.to_string()), DataType::Text)),
            },
            None => Ok((MetricValue::Text(raw.to_string()), DataType::Text)),
        },
        _ => Ok((MetricValue::Text(raw.trim_matches('"').to_string()), DataType::Text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_and_strings() {
        let output = "\
.1.3.6.1.2.1.31.1.1.1.6.1 = Counter64: 123456789012
.1.3.6.1.2.1.31.1.1.1.6.2 = Counter64: 0
";
        let values = parse_walk(".1.3.6.1.2.1.31.1.1.1.6", output).unwrap();
        assert_eq!(
            values,
            vec![
                WalkValue {
                    sub_key: SubKey::Index(1),
                    value: MetricValue::Unsigned(123456789012),
                    data_type: DataType::Counter,
                },
                WalkValue {
                    sub_key: SubKey::Index(2),
                    value: MetricValue::Unsigned(0),
                    data_type: DataType::Counter,
                },
            ]
        );

        let output = ".1.3.6.1.2.1.2.2.1.2.1 = STRING: \"lo\"\n.1.3.6.1.2.1.2.2.1.2.7 = STRING: \"Gigabit Ethernet 1/0/1\"\n";
        let values = parse_walk("1.3.6.1.2.1.2.2.1.2", output).unwrap();
        assert_eq!(values[1].sub_key, SubKey::Index(7));
        assert_eq!(values[1].value, MetricValue::Text("Gigabit Ethernet 1/0/1".to_string()));
        assert_eq!(values[1].data_type, DataType::Text);
    }

    #[test]
    fn enumerations_and_timeticks_keep_their_number() {
        let output = "\
.1.3.6.1.2.1.2.2.1.8.1 = INTEGER: up(1)
.1.3.6.1.2.1.2.2.1.9.1 = Timeticks: (4200) 0:00:42.00
.1.3.6.1.2.1.2.2.1.5.1 = Gauge32: 1000000000
";
        let values = parse_walk(".1.3.6.1.2.1.2.2.1", output).unwrap();
        let parsed: Vec<_> = values.iter().map(|v| (v.value.clone(), v.data_type)).collect();
        assert_eq!(
            parsed,
            vec![
                (MetricValue::Unsigned(1), DataType::Gauge),
                (MetricValue::Unsigned(4200), DataType::Gauge),
                (MetricValue::Unsigned(1000000000), DataType::Gauge),
            ]
        );
        assert_eq!(values[0].sub_key, SubKey::Name("8.1".to_string()));
    }

    #[test]
    fn unsupported_subtree() {
        let output = ".1.3.6.1.2.1.31.1.1.1.18 = No Such Object available on this agent at this OID\n";
        assert!(matches!(
            parse_walk(".1.3.6.1.2.1.31.1.1.1.18", output),
            Err(FetchError::Unsupported(_))
        ));
    }

    #[test]
    fn empty_walk_is_not_an_error() {
        assert_eq!(parse_walk(".1.3.6.1.4.1.9", "").unwrap(), Vec::new());
    }

    #[test]
    fn empty_and_multi_line_strings() {
        let output = ".1.3.6.1.2.1.31.1.1.1.18.1 = \"\"\n.1.3.6.1.2.1.31.1.1.1.18.2 = STRING: \"uplink\nto core\"\n";
        let values = parse_walk(".1.3.6.1.2.1.31.1.1.1.18", output).unwrap();
        assert_eq!(values[0].value, MetricValue::Text(String::new()));
        assert_eq!(values[1].value, MetricValue::Text("uplink\nto core".to_string()));
    }

    #[test]
    fn community_and_v3_arguments() {
        let session = NetSnmpSession {
            bulkwalk: None,
            walk: Some(PathBuf::from("/usr/bin/snmpwalk")),
            timeout: Duration::from_secs(5),
        };

        let args = session.arguments("switch-1", &SnmpAuthGroup::default(), ".1.3.6.1.2.1.2.2.1.10");
        assert_eq!(
            args,
            vec!["-On", "-Oe", "-t", "5", "-r", "0", "-v", "2c", "-c", "public", "switch-1:161", ".1.3.6.1.2.1.2.2.1.10"]
        );

        let v3 = SnmpAuthGroup {
            snmp_version: 3,
            snmp_secname: Some("monitor".to_string()),
            snmp_authprotocol: Some("sha".to_string()),
            snmp_authpassword: Some("secret".to_string()),
            ..SnmpAuthGroup::default()
        };
        let args = session.arguments("switch-1", &v3, ".1.3");
        assert_eq!(
            &args[6..],
            &["-v", "3", "-u", "monitor", "-l", "authNoPriv", "-a", "SHA", "switch-1:161", ".1.3"]
        );
    }

    #[test]
    fn v3_passphrases_stay_off_the_command_line() {
        let session = NetSnmpSession {
            bulkwalk: Some(PathBuf::from("/usr/bin/snmpbulkwalk")),
            walk: None,
            timeout: Duration::from_secs(5),
        };
        let v3 = SnmpAuthGroup {
            snmp_version: 3,
            snmp_secname: Some("monitor".to_string()),
            snmp_authpassword: Some("auth secret".to_string()),
            snmp_privprotocol: Some("des".to_string()),
            snmp_privpassword: Some("pr\"iv".to_string()),
            ..SnmpAuthGroup::default()
        };

        let args = session.arguments("switch-1", &v3, ".1.3");
        assert!(args.iter().all(|arg| !arg.contains("secret") && !arg.contains("iv\"")), "{args:?}");
        assert_eq!(&args[10..16], &["-l", "authPriv", "-a", "SHA", "-x", "DES"]);

        let conf = v3_passphrases(&v3).unwrap();
        assert_eq!(conf, "defAuthPassphrase \"auth secret\"\ndefPrivPassphrase \"pr\\\"iv\"\n");

        let dir = private_conf(&conf).unwrap();
        let path = dir.child("snmp.conf");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), conf);
        let mode = std::os::unix::fs::PermissionsExt::mode(&std::fs::metadata(&path).unwrap().permissions());
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn communities_need_no_conf() {
        assert_eq!(v3_passphrases(&SnmpAuthGroup::default()), None);
        let no_auth = SnmpAuthGroup {
            snmp_version: 3,
            snmp_secname: Some("monitor".to_string()),
            ..SnmpAuthGroup::default()
        };
        assert_eq!(v3_passphrases(&no_auth), None);
    }

    #[test]
    fn missing_tools_are_reported() {
        let session = NetSnmpSession {
            bulkwalk: Some(PathBuf::from("/usr/bin/snmpbulkwalk")),
            walk: None,
            timeout: Duration::from_secs(5),
        };
        assert!(session.program(2).is_ok());
        assert!(matches!(session.program(1), Err(FetchError::ToolMissing("snmpwalk"))));
    }
}
