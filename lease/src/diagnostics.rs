/// Who holds a lock marker. Written into the marker for operators; the lock protocol never
/// reads it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub host_name: String,
    pub host_address: String,
    pub process_id: u32,
}

impl Diagnostics {
    #[must_use]
    pub fn current() -> Self {
        Self {
            host_name: host_name(),
            host_address: host_address(),
            process_id: std::process::id(),
        }
    }

    /// Parses marker contents, `None` if they were not written by [`Diagnostics`].
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let host_name = lines.next()?.to_string();
        let host_address = lines.next()?.to_string();
        let process_id = lines.next()?.parse().ok()?;
        if lines.next().is_some() {
            return None;
        }
        Some(Self {
            host_name,
            host_address,
            process_id,
        })
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "{}", self.host_name)?;
        writeln!(f, "{}", self.host_address)?;
        writeln!(f, "{}", self.process_id)
    }
}

fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn host_address() -> String {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .iter()
            .find(|interface| !interface.is_loopback() && interface.ip().is_ipv4())
            .or_else(|| interfaces.iter().find(|interface| !interface.is_loopback()))
            .map(|interface| interface.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        Err(error) => {
            tracing::debug!("failed listing network interfaces: {:#}", &error);
            "127.0.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_renders_three_lines() {
        let diagnostics = Diagnostics::current();
        let text = diagnostics.to_string();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(diagnostics.process_id, std::process::id());
        assert_eq!(Diagnostics::parse(&text), Some(diagnostics));
    }

    #[test]
    fn parse_rejects_foreign_markers() {
        assert_eq!(Diagnostics::parse(""), None);
        assert_eq!(Diagnostics::parse("host\n10.0.0.1\nnot-a-pid\n"), None);
        assert_eq!(Diagnostics::parse("host\n10.0.0.1\n42\nextra\n"), None);
        assert_eq!(
            Diagnostics::parse("host\n10.0.0.1\n42\n"),
            Some(Diagnostics {
                host_name: "host".to_string(),
                host_address: "10.0.0.1".to_string(),
                process_id: 42,
            })
        );
    }
}
