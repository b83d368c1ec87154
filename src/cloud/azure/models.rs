//! The subset of Azure Resource Manager payloads we read.

use serde::Deserialize;

/// A list response; `next_link` points at the next page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmList<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScaleSet {
    pub id: Option<String>,
    pub name: Option<String>,
    pub properties: Option<ScaleSetProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetProperties {
    pub orchestration_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationMode {
    Uniform,
    Flexible,
    Other(String),
}

impl OrchestrationMode {
    pub fn parse(mode: Option<&str>) -> Self {
        match mode {
            Some("Uniform") => OrchestrationMode::Uniform,
            Some("Flexible") => OrchestrationMode::Flexible,
            Some(other) => OrchestrationMode::Other(other.to_string()),
            None => OrchestrationMode::Other("<unset>".to_string()),
        }
    }
}

/// A member of a Flexible scale set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScaleSetVm {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualMachine {
    pub id: Option<String>,
    pub name: Option<String>,
    pub properties: Option<VirtualMachineProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    pub network_interfaces: Option<Vec<ResourceReference>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceReference {
    pub id: Option<String>,
}

impl VirtualMachine {
    /// Ids of the attached network interfaces, `None` without a network profile.
    pub fn network_interface_ids(&self) -> Option<Vec<&str>> {
        let interfaces = self
            .properties
            .as_ref()?
            .network_profile
            .as_ref()?
            .network_interfaces
            .as_ref()?;
        let ids = interfaces
            .iter()
            .filter_map(|reference| reference.id.as_deref())
            .collect();
        Some(ids)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkInterface {
    pub id: Option<String>,
    pub name: Option<String>,
    pub properties: Option<NetworkInterfaceProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceProperties {
    pub virtual_machine: Option<ResourceReference>,
    pub ip_configurations: Option<Vec<IpConfiguration>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpConfiguration {
    pub name: Option<String>,
    pub properties: Option<IpConfigurationProperties>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpConfigurationProperties {
    pub primary: Option<bool>,
    #[serde(rename = "privateIPAddress")]
    pub private_ip_address: Option<String>,
}

impl NetworkInterface {
    /// Private address of the primary IP configuration, for interfaces attached
    /// to a virtual machine.
    pub fn primary_private_ip(&self) -> Option<&str> {
        let properties = self.properties.as_ref()?;
        properties.virtual_machine.as_ref()?.id.as_ref()?;
        properties
            .ip_configurations
            .as_ref()?
            .iter()
            .filter_map(|config| config.properties.as_ref())
            .find_map(|props| match props.primary {
                Some(true) => props.private_ip_address.as_deref(),
                _ => None,
            })
    }
}

/// ARM error envelope, `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Deserialize)]
pub struct ArmErrorBody {
    pub error: ArmErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ArmErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}
