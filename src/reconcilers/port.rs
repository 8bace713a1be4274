use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// Platform port override, checked first
pub const PORT_OVERRIDE_VAR: &str = "ENCLII_PORT";
/// Conventional port variable, checked second
pub const PORT_VAR: &str = "PORT";
/// Used when neither variable yields a port
pub const DEFAULT_PORT: i32 = 4200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSource {
    Override,
    Conventional,
    Default,
}

impl fmt::Display for PortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortSource::Override => PORT_OVERRIDE_VAR,
            PortSource::Conventional => PORT_VAR,
            PortSource::Default => "default",
        })
    }
}

/// Outcome of port resolution.
///
/// `port` is always usable. `error` is set when a variable was present but
/// invalid, in which case `port` is [`DEFAULT_PORT`].
#[derive(Debug)]
pub struct ResolvedPort {
    pub port: i32,
    pub source: PortSource,
    pub error: Option<Error>,
}

fn parse_port(var: &str, raw: &str) -> Result<i32, Error> {
    let port: i64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidPort(format!("invalid {var} value '{raw}'")))?;
    if !(1..=65535).contains(&port) {
        return Err(Error::InvalidPort(format!(
            "{var} {port} out of valid range (1-65535)"
        )));
    }
    Ok(port as i32)
}

/// Resolves the container port from a service's environment.
///
/// The first non-empty variable of [`PORT_OVERRIDE_VAR`] and [`PORT_VAR`]
/// decides; an invalid value does not fall through to the next variable.
pub fn resolve_port(env: &BTreeMap<String, String>) -> ResolvedPort {
    let candidates = [
        (PORT_OVERRIDE_VAR, PortSource::Override),
        (PORT_VAR, PortSource::Conventional),
    ];

    for (var, source) in candidates {
        let Some(raw) = env.get(var).filter(|v| !v.is_empty()) else {
            continue;
        };
        return match parse_port(var, raw) {
            Ok(port) => ResolvedPort {
                port,
                source,
                error: None,
            },
            Err(err) => ResolvedPort {
                port: DEFAULT_PORT,
                source: PortSource::Default,
                error: Some(err),
            },
        };
    }

    ResolvedPort {
        port: DEFAULT_PORT,
        source: PortSource::Default,
        error: None,
    }
}
