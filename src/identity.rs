use crate::config::Config;
use crate::opamp::defaults::string_key_value;
use crate::opamp::spec::AgentDescription;
use crate::opamp::util::generate_ulid;
use sysinfo::{System, SystemExt};

pub const SERVICE_NAME: &str = "com.observiq.collector";

/// Identifying information about the running agent, reported as its agent description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub service_name: String,
    pub version: String,
    pub labels: Option<String>,
    pub os_arch: String,
    pub os_details: String,
    pub os_family: String,
    pub hostname: String,
}

impl Identity {
    pub fn new(config: &Config, version: &str) -> Identity {
        let sys = System::new();
        let hostname = sys.host_name().unwrap_or_else(|| {
            log::warn!("failed to retrieve hostname, creating partial identity");
            String::new()
        });
        let os_details = sys.long_os_version().unwrap_or_else(|| {
            log::warn!("failed to retrieve host details, creating partial identity");
            String::new()
        });

        let agent_id = if config.agent_id.is_empty() {
            let generated = generate_ulid().to_string();
            log::warn!("no agent_id configured, generated agent_id={}", generated);
            generated
        } else {
            config.agent_id.clone()
        };

        Identity {
            agent_id,
            agent_name: config.agent_name.clone(),
            service_name: SERVICE_NAME.to_string(),
            version: version.to_string(),
            labels: config.labels.clone(),
            os_arch: std::env::consts::ARCH.to_string(),
            os_details,
            os_family: std::env::consts::OS.to_string(),
            hostname,
        }
    }

    /// Picks up a new agent name and labels after the manager config changed
    pub fn update(&mut self, config: &Config) {
        self.agent_name = config.agent_name.clone();
        self.labels = config.labels.clone();
    }

    pub fn to_agent_description(&self) -> AgentDescription {
        let instance_name = self.agent_name.as_deref().unwrap_or(&self.hostname);
        let identifying_attributes = vec![
            string_key_value("service.instance.id", &self.agent_id),
            string_key_value("service.name", &self.service_name),
            string_key_value("service.version", &self.version),
            string_key_value("service.instance.name", instance_name),
        ];

        let mut non_identifying_attributes = vec![
            string_key_value("os.arch", &self.os_arch),
            string_key_value("os.details", &self.os_details),
            string_key_value("os.family", &self.os_family),
            string_key_value("host.name", &self.hostname),
        ];
        if let Some(labels) = &self.labels {
            non_identifying_attributes.push(string_key_value("service.labels", labels));
        }

        AgentDescription {
            identifying_attributes,
            non_identifying_attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opamp::spec::{any_value, KeyValue};

    fn lookup<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a str> {
        attrs
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match &v.value {
                Some(any_value::Value::StringValue(s)) => Some(s.as_str()),
                _ => None,
            })
    }

    fn identity() -> Identity {
        Identity {
            agent_id: "01H4".to_string(),
            agent_name: None,
            service_name: SERVICE_NAME.to_string(),
            version: "1.40.0".to_string(),
            labels: None,
            os_arch: "amd64".to_string(),
            os_details: "Ubuntu 22.04".to_string(),
            os_family: "linux".to_string(),
            hostname: "edge-host".to_string(),
        }
    }

    #[test]
    fn instance_name_falls_back_to_hostname() {
        let desc = identity().to_agent_description();
        assert_eq!(
            lookup(&desc.identifying_attributes, "service.instance.name"),
            Some("edge-host")
        );
        assert_eq!(
            lookup(&desc.identifying_attributes, "service.name"),
            Some(SERVICE_NAME)
        );
        assert_eq!(
            lookup(&desc.non_identifying_attributes, "service.labels"),
            None
        );
    }

    #[test]
    fn update_changes_name_and_labels() {
        let mut ident = identity();
        ident.update(&Config {
            agent_name: Some("gateway".to_string()),
            labels: Some("env=prod".to_string()),
            ..Default::default()
        });
        let desc = ident.to_agent_description();
        assert_eq!(
            lookup(&desc.identifying_attributes, "service.instance.name"),
            Some("gateway")
        );
        assert_eq!(
            lookup(&desc.non_identifying_attributes, "service.labels"),
            Some("env=prod")
        );
        assert_eq!(lookup(&desc.non_identifying_attributes, "os.family"), Some("linux"));
    }

    #[test]
    fn new_reads_config() {
        let config = Config {
            agent_id: "agent-1".to_string(),
            agent_name: Some("edge".to_string()),
            ..Default::default()
        };
        let ident = Identity::new(&config, "2.0.0");
        assert_eq!(ident.agent_id, "agent-1");
        assert_eq!(ident.version, "2.0.0");
        assert_eq!(ident.os_family, std::env::consts::OS);
    }

    #[test]
    fn missing_agent_id_is_generated() {
        let ident = Identity::new(&Config::default(), "2.0.0");
        assert_eq!(ident.agent_id.len(), 26);
        assert!(ident.agent_id.parse::<ulid::Ulid>().is_ok());
    }
}
