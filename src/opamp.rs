/// The subset of the OpAMP protobuf messages used by the agent components.
///
/// These are declared with the `prost` derive macros directly rather than generated from the
/// upstream `opamp.proto`, so only the fields the components read or write are present.
pub mod spec {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AgentConfigFile {
        #[prost(bytes = "vec", tag = "1")]
        pub body: Vec<u8>,
        #[prost(string, tag = "2")]
        pub content_type: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AgentConfigMap {
        #[prost(map = "string, message", tag = "1")]
        pub config_map: HashMap<String, AgentConfigFile>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EffectiveConfig {
        #[prost(bytes = "vec", tag = "1")]
        pub hash: Vec<u8>,
        #[prost(message, optional, tag = "2")]
        pub config_map: Option<AgentConfigMap>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AgentRemoteConfig {
        #[prost(message, optional, tag = "1")]
        pub config: Option<AgentConfigMap>,
        #[prost(bytes = "vec", tag = "2")]
        pub config_hash: Vec<u8>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RemoteConfigStatuses {
        Unset = 0,
        Applied = 1,
        Applying = 2,
        Failed = 3,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RemoteConfigStatus {
        #[prost(bytes = "vec", tag = "1")]
        pub last_remote_config_hash: Vec<u8>,
        #[prost(enumeration = "RemoteConfigStatuses", tag = "2")]
        pub status: i32,
        #[prost(string, tag = "3")]
        pub error_message: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum PackageStatusEnum {
        Installed = 0,
        InstallPending = 1,
        Installing = 2,
        InstallFailed = 3,
        Downloading = 4,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PackageStatus {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub agent_has_version: String,
        #[prost(bytes = "vec", tag = "3")]
        pub agent_has_hash: Vec<u8>,
        #[prost(string, tag = "4")]
        pub server_offered_version: String,
        #[prost(bytes = "vec", tag = "5")]
        pub server_offered_hash: Vec<u8>,
        #[prost(enumeration = "PackageStatusEnum", tag = "6")]
        pub status: i32,
        #[prost(string, tag = "7")]
        pub error_message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PackageStatuses {
        #[prost(map = "string, message", tag = "1")]
        pub packages: HashMap<String, PackageStatus>,
        #[prost(bytes = "vec", tag = "2")]
        pub server_provided_all_packages_hash: Vec<u8>,
        #[prost(string, tag = "3")]
        pub error_message: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum PackageType {
        TopLevel = 0,
        Addon = 1,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DownloadableFile {
        #[prost(string, tag = "1")]
        pub download_url: String,
        #[prost(bytes = "vec", tag = "2")]
        pub content_hash: Vec<u8>,
        #[prost(bytes = "vec", tag = "3")]
        pub signature: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PackageAvailable {
        #[prost(enumeration = "PackageType", tag = "1")]
        pub r#type: i32,
        #[prost(string, tag = "2")]
        pub version: String,
        #[prost(message, optional, tag = "3")]
        pub file: Option<DownloadableFile>,
        #[prost(bytes = "vec", tag = "4")]
        pub hash: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PackagesAvailable {
        #[prost(map = "string, message", tag = "1")]
        pub packages: HashMap<String, PackageAvailable>,
        #[prost(bytes = "vec", tag = "2")]
        pub all_packages_hash: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CustomMessage {
        #[prost(string, tag = "1")]
        pub capability: String,
        #[prost(string, tag = "2")]
        pub r#type: String,
        #[prost(bytes = "vec", tag = "3")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AnyValue {
        #[prost(oneof = "any_value::Value", tags = "1, 2, 3, 4, 7")]
        pub value: Option<any_value::Value>,
    }

    pub mod any_value {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Value {
            #[prost(string, tag = "1")]
            StringValue(String),
            #[prost(bool, tag = "2")]
            BoolValue(bool),
            #[prost(int64, tag = "3")]
            IntValue(i64),
            #[prost(double, tag = "4")]
            DoubleValue(f64),
            #[prost(bytes, tag = "7")]
            BytesValue(Vec<u8>),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyValue {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(message, optional, tag = "2")]
        pub value: Option<AnyValue>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AgentDescription {
        #[prost(message, repeated, tag = "1")]
        pub identifying_attributes: Vec<KeyValue>,
        #[prost(message, repeated, tag = "2")]
        pub non_identifying_attributes: Vec<KeyValue>,
    }

    /// Outbound report assembled by the agent handlers. Only the fields the agent
    /// components populate are carried.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AgentToServer {
        #[prost(string, tag = "1")]
        pub instance_uid: String,
        #[prost(uint64, tag = "2")]
        pub sequence_num: u64,
        #[prost(message, optional, tag = "3")]
        pub agent_description: Option<AgentDescription>,
        #[prost(uint64, tag = "4")]
        pub capabilities: u64,
        #[prost(message, optional, tag = "6")]
        pub effective_config: Option<EffectiveConfig>,
        #[prost(message, optional, tag = "7")]
        pub remote_config_status: Option<RemoteConfigStatus>,
        #[prost(message, optional, tag = "8")]
        pub package_statuses: Option<PackageStatuses>,
        #[prost(message, optional, tag = "13")]
        pub custom_message: Option<CustomMessage>,
    }
}

pub mod util {
    pub fn generate_ulid() -> ulid::Ulid {
        let mut rng = rand::thread_rng();
        ulid::Ulid::from_datetime_with_source(std::time::SystemTime::now(), &mut rng)
    }
}

pub mod defaults {
    use super::spec::*;

    pub fn remote_config_status(hash: &[u8]) -> RemoteConfigStatus {
        RemoteConfigStatus {
            last_remote_config_hash: hash.to_vec(),
            status: RemoteConfigStatuses::Applied.into(),
            error_message: "".to_string(),
        }
    }

    pub fn string_key_value(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }
}

/// Content type reported for a config file, inferred from its extension
pub fn determine_content_type(path: &str) -> &'static str {
    match std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some("yaml") | Some("yml") => "text/yaml",
        Some("json") => "text/json",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::spec::*;
    use super::*;
    use prost::Message;

    #[test]
    fn content_type_from_extension() {
        assert_eq!(determine_content_type("config.yaml"), "text/yaml");
        assert_eq!(determine_content_type("/etc/agent/logging.yml"), "text/yaml");
        assert_eq!(determine_content_type("report.json"), "text/json");
        assert_eq!(determine_content_type("README"), "");
    }

    #[test]
    fn package_status_enum_accessors() {
        let mut status = PackageStatus {
            name: "observiq-otel-collector".to_string(),
            ..Default::default()
        };
        assert_eq!(status.status(), PackageStatusEnum::Installed);
        status.set_status(PackageStatusEnum::InstallFailed);
        assert_eq!(status.status, 3);
    }

    #[test]
    fn custom_message_wire_encoding() {
        let msg = CustomMessage {
            capability: "com.bindplane.snapshot".to_string(),
            r#type: "reportSnapshot".to_string(),
            data: vec![1, 2, 3],
        };
        let decoded = CustomMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ulids_are_unique() {
        assert_ne!(util::generate_ulid(), util::generate_ulid());
    }
}
