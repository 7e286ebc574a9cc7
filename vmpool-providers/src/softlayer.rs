use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use vmpool_common::agent_settings::AgentSettings;
use vmpool_common::{
    BlockDevice, CpiError, CpiResult, Credential, ErrorKind, Instance, NetworkComponent,
    PowerState, StemcellRef, Transaction,
};

use crate::{inventory, ComputeProvider};

pub const DEFAULT_ENDPOINT: &str = "https://api.softlayer.com/rest/v3.1";

const GUEST_SERVICE: &str = "SoftLayer_Virtual_Guest";
const GUEST_MASK: &str = "mask[id,hostname,domain,startCpus,maxMemory,primaryIpAddress,\
primaryBackendIpAddress,powerState,activeTransactions[transactionGroup,transactionStatus],\
lastTransaction[transactionGroup,transactionStatus],blockDevices[diskImage],\
networkComponents,networkVlans[id,networkSpace]]";
const TRANSACTION_MASK: &str = "mask[id,createDate,transactionGroup,transactionStatus]";
const EPHEMERAL_DISK_CATEGORY: &str = "guest_disk1";

pub struct SoftLayerProvider {
    client: Client,
    endpoint: String,
    username: String,
    api_key: String,
}

impl SoftLayerProvider {
    pub fn new(username: String, api_key: String, endpoint: Option<String>) -> anyhow::Result<Self> {
        // Without an overall timeout a stalled API call would hang the workflow forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("building SoftLayer HTTP client")?;
        let endpoint = endpoint
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self {
            client,
            endpoint,
            username: username.trim().to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn url(&self, service: &str, id: Option<u64>, method: &str) -> String {
        match id {
            Some(id) => format!("{}/{}/{}/{}.json", self.endpoint, service, id, method),
            None => format!("{}/{}/{}.json", self.endpoint, service, method),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> CpiResult<T> {
        tracing::debug!(url, "SoftLayer GET");
        let resp = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.api_key))
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        decode(url, resp).await
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &Value) -> CpiResult<T> {
        tracing::debug!(url, "SoftLayer POST");
        let resp = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.api_key))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(url, resp).await
    }

    async fn find_guest_by_ip(&self, field: &str, ip: IpAddr) -> CpiResult<Instance> {
        let filter = json!({ "virtualGuests": { field: { "operation": ip.to_string() } } });
        let filter = filter.to_string();
        let url = self.url("SoftLayer_Account", None, "getVirtualGuests");
        let guests: Vec<SlGuest> = self
            .get(&url, &[("objectMask", GUEST_MASK), ("objectFilter", filter.as_str())])
            .await?;
        guests
            .into_iter()
            .next()
            .map(SlGuest::into_instance)
            .ok_or_else(|| CpiError::not_found(format!("no virtual guest with {} {}", field, ip)))
    }

    async fn ephemeral_disk_price(&self, cid: u64, size_gb: u64) -> CpiResult<u64> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getUpgradeItemPrices");
        let prices: Vec<SlItemPrice> = self
            .get(
                &url,
                &[
                    ("includeDownpaymentPriceFlag", "true"),
                    ("objectMask", "mask[id,categories[categoryCode],item[capacity]]"),
                ],
            )
            .await?;
        pick_disk_price(&prices, size_gb).ok_or_else(|| {
            CpiError::new(
                ErrorKind::ResourceExhausted,
                format!(
                    "no upgrade price for a {}GB ephemeral disk on instance {}",
                    size_gb, cid
                ),
            )
        })
    }
}

fn transport(err: reqwest::Error) -> CpiError {
    CpiError::cloud(format!("SoftLayer request failed: {}", err))
}

async fn decode<T: DeserializeOwned>(url: &str, resp: Response) -> CpiResult<T> {
    let status = resp.status();
    let text = resp.text().await.map_err(transport)?;
    if status == StatusCode::NOT_FOUND {
        return Err(CpiError::not_found(format!(
            "SoftLayer {} returned 404: {}",
            url,
            api_error_message(&text)
        )));
    }
    if !status.is_success() {
        return Err(CpiError::cloud(format!(
            "SoftLayer {} failed: status={} error={}",
            url,
            status.as_u16(),
            api_error_message(&text)
        )));
    }
    Ok(serde_json::from_str(&text)?)
}

/// SoftLayer wraps failures as `{"error": "...", "code": "..."}`.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| body.to_string())
}

fn pick_disk_price(prices: &[SlItemPrice], size_gb: u64) -> Option<u64> {
    prices
        .iter()
        .filter(|p| {
            p.categories
                .iter()
                .any(|c| c.category_code == EPHEMERAL_DISK_CATEGORY)
        })
        .find(|p| {
            p.item
                .as_ref()
                .and_then(|i| i.capacity_gb())
                .map_or(false, |cap| cap == size_gb)
        })
        .map(|p| p.id)
}

fn render_create_template(t: &inventory::InstanceTemplate) -> Value {
    let mut body = json!({
        "hostname": t.hostname,
        "domain": t.domain,
        "startCpus": t.start_cpus,
        "maxMemory": t.max_memory_mb,
        "datacenter": { "name": t.datacenter },
        "hourlyBillingFlag": t.hourly_billing,
        "localDiskFlag": t.local_disk,
        "dedicatedAccountHostOnlyFlag": t.dedicated_host,
        "networkComponents": [{ "maxSpeed": t.max_network_speed }],
        "blockDeviceTemplateGroup": { "globalIdentifier": t.image_global_id },
    });
    if let Some(vlan) = t.public_vlan_id {
        body["primaryNetworkComponent"] = json!({ "networkVlan": { "id": vlan } });
    }
    if let Some(vlan) = t.private_vlan_id {
        body["primaryBackendNetworkComponent"] = json!({ "networkVlan": { "id": vlan } });
    }
    if !t.ssh_key_ids.is_empty() {
        body["sshKeys"] = Value::Array(t.ssh_key_ids.iter().map(|id| json!({ "id": id })).collect());
    }
    if let Some(ud) = t.user_data.as_deref().filter(|s| !s.is_empty()) {
        body["userData"] = json!([{ "value": ud }]);
    }
    body
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlName {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlKeyName {
    key_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlTransaction {
    id: u64,
    create_date: Option<DateTime<FixedOffset>>,
    transaction_group: Option<SlName>,
    transaction_status: Option<SlName>,
}

impl SlTransaction {
    fn into_transaction(self) -> Transaction {
        Transaction {
            id: self.id,
            group: self.transaction_group.map(|g| g.name),
            status: self.transaction_status.map(|s| s.name),
            created_at: self.create_date.map(|d| d.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlDiskImage {
    capacity: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlBlockDevice {
    id: u64,
    #[serde(default)]
    device: String,
    disk_image: Option<SlDiskImage>,
}

impl SlBlockDevice {
    fn into_block_device(self) -> BlockDevice {
        BlockDevice {
            id: self.id,
            device: self.device,
            capacity_gb: self.disk_image.and_then(|d| d.capacity),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlNetworkComponent {
    id: u64,
    #[serde(default)]
    port: u32,
    primary_ip_address: Option<String>,
    max_speed: Option<u32>,
    network_vlan_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlVlan {
    id: u64,
    network_space: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlGuest {
    id: u64,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    start_cpus: u32,
    #[serde(default)]
    max_memory: u64,
    primary_ip_address: Option<String>,
    primary_backend_ip_address: Option<String>,
    power_state: Option<SlKeyName>,
    #[serde(default)]
    active_transactions: Vec<SlTransaction>,
    last_transaction: Option<SlTransaction>,
    #[serde(default)]
    block_devices: Vec<SlBlockDevice>,
    #[serde(default)]
    network_components: Vec<SlNetworkComponent>,
    #[serde(default)]
    network_vlans: Vec<SlVlan>,
}

fn parse_ip(s: Option<String>) -> Option<IpAddr> {
    s.and_then(|s| s.trim().parse().ok())
}

impl SlGuest {
    fn into_instance(self) -> Instance {
        let vlan = |space: &str| {
            self.network_vlans
                .iter()
                .find(|v| v.network_space.as_deref() == Some(space))
                .map(|v| v.id)
        };
        let private_vlan = vlan("PRIVATE");
        let public_vlan = vlan("PUBLIC");
        Instance {
            cid: self.id,
            hostname: self.hostname,
            domain: self.domain,
            start_cpus: self.start_cpus,
            max_memory_mb: self.max_memory,
            primary_ip: parse_ip(self.primary_ip_address),
            primary_backend_ip: parse_ip(self.primary_backend_ip_address),
            power_state: self.power_state.map(|p| PowerState::from_key_name(&p.key_name)),
            private_vlan,
            public_vlan,
            active_transactions: self
                .active_transactions
                .into_iter()
                .map(SlTransaction::into_transaction)
                .collect(),
            last_transaction: self.last_transaction.map(SlTransaction::into_transaction),
            block_devices: self
                .block_devices
                .into_iter()
                .map(SlBlockDevice::into_block_device)
                .collect(),
            network_components: self
                .network_components
                .into_iter()
                .map(|n| NetworkComponent {
                    id: n.id,
                    port: n.port,
                    primary_ip: parse_ip(n.primary_ip_address),
                    max_speed: n.max_speed,
                    vlan_id: n.network_vlan_id,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlCategory {
    category_code: String,
}

#[derive(Debug, Deserialize)]
struct SlItem {
    // Capacity comes back as a decimal string ("100") or a number depending on the mask.
    capacity: Option<Value>,
}

impl SlItem {
    fn capacity_gb(&self) -> Option<u64> {
        match self.capacity.as_ref()? {
            Value::Number(n) => n.as_f64().map(|f| f as u64),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SlItemPrice {
    id: u64,
    #[serde(default)]
    categories: Vec<SlCategory>,
    item: Option<SlItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlOrderReceipt {
    #[serde(default)]
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct SlPassword {
    id: u64,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct SlOperatingSystem {
    #[serde(default)]
    passwords: Vec<SlPassword>,
}

#[async_trait]
impl ComputeProvider for SoftLayerProvider {
    async fn create_instance(&self, template: &inventory::InstanceTemplate) -> CpiResult<Instance> {
        let url = self.url(GUEST_SERVICE, None, "createObject");
        let body = json!({ "parameters": [render_create_template(template)] });
        tracing::info!(
            hostname = %template.hostname,
            datacenter = %template.datacenter,
            cpus = template.start_cpus,
            memory_mb = template.max_memory_mb,
            "SoftLayer createObject"
        );
        let guest: SlGuest = self.post(&url, &body).await?;
        Ok(guest.into_instance())
    }

    async fn get_instance(&self, cid: u64) -> CpiResult<Instance> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getObject");
        let guest: SlGuest = self.get(&url, &[("objectMask", GUEST_MASK)]).await?;
        Ok(guest.into_instance())
    }

    async fn get_active_transactions(&self, cid: u64) -> CpiResult<Vec<Transaction>> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getActiveTransactions");
        let txs: Vec<SlTransaction> = self.get(&url, &[("objectMask", TRANSACTION_MASK)]).await?;
        Ok(txs.into_iter().map(SlTransaction::into_transaction).collect())
    }

    async fn get_last_transaction(&self, cid: u64) -> CpiResult<Option<Transaction>> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getLastTransaction");
        let raw: Value = self.get(&url, &[("objectMask", TRANSACTION_MASK)]).await?;
        // No transaction yet comes back as null or {}.
        if raw.is_null() || raw.as_object().map_or(false, |o| o.is_empty()) {
            return Ok(None);
        }
        let tx: SlTransaction = serde_json::from_value(raw)?;
        Ok(Some(tx.into_transaction()))
    }

    async fn get_power_state(&self, cid: u64) -> CpiResult<PowerState> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getPowerState");
        let state: SlKeyName = self.get(&url, &[]).await?;
        Ok(PowerState::from_key_name(&state.key_name))
    }

    async fn is_pingable(&self, cid: u64) -> CpiResult<bool> {
        let url = self.url(GUEST_SERVICE, Some(cid), "isPingable");
        self.get(&url, &[]).await
    }

    async fn attach_ephemeral_disk(&self, cid: u64, size_gb: u64) -> CpiResult<u64> {
        let price_id = self.ephemeral_disk_price(cid, size_gb).await?;
        let url = self.url("SoftLayer_Product_Order", None, "placeOrder");
        let order = json!({
            "complexType": "SoftLayer_Container_Product_Order_Virtual_Guest_Upgrade",
            "virtualGuests": [{ "id": cid }],
            "prices": [{
                "id": price_id,
                "categories": [{
                    "categoryCode": EPHEMERAL_DISK_CATEGORY,
                    "complexType": "SoftLayer_Product_Item_Category",
                }],
            }],
            "properties": [{ "name": "MAINTENANCE_WINDOW", "value": Utc::now().to_rfc3339() }],
        });
        tracing::info!(cid, size_gb, price_id, "placing ephemeral disk upgrade order");
        let receipt: SlOrderReceipt = self.post(&url, &json!({ "parameters": [order, true] })).await?;
        Ok(receipt.order_id)
    }

    async fn get_block_devices(&self, cid: u64) -> CpiResult<Vec<BlockDevice>> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getBlockDevices");
        let devices: Vec<SlBlockDevice> = self.get(&url, &[("objectMask", "mask[id,device,diskImage[capacity]]")]).await?;
        Ok(devices.into_iter().map(SlBlockDevice::into_block_device).collect())
    }

    async fn get_instance_by_private_ip(&self, ip: IpAddr) -> CpiResult<Instance> {
        self.find_guest_by_ip("primaryBackendIpAddress", ip).await
    }

    async fn get_instance_by_public_ip(&self, ip: IpAddr) -> CpiResult<Instance> {
        self.find_guest_by_ip("primaryIpAddress", ip).await
    }

    async fn os_reload(&self, cid: u64, stemcell: &StemcellRef) -> CpiResult<()> {
        let url = self.url(GUEST_SERVICE, Some(cid), "reloadOperatingSystem");
        let body = json!({ "parameters": ["FORCE", { "imageTemplateId": stemcell.id }] });
        tracing::info!(cid, stemcell_id = stemcell.id, "SoftLayer reloadOperatingSystem");
        let _: Value = self.post(&url, &body).await?;
        Ok(())
    }

    async fn push_agent_settings(&self, cid: u64, settings: &AgentSettings) -> CpiResult<()> {
        let url = self.url(GUEST_SERVICE, Some(cid), "setUserMetadata");
        let payload = serde_json::to_string(settings)?;
        let ok: bool = self.post(&url, &json!({ "parameters": [[payload]] })).await?;
        if !ok {
            return Err(CpiError::cloud(format!(
                "SoftLayer refused user metadata for instance {}",
                cid
            )));
        }
        Ok(())
    }

    async fn set_credential(&self, cid: u64, credential: &Credential) -> CpiResult<()> {
        let url = self.url(GUEST_SERVICE, Some(cid), "getOperatingSystem");
        let os: SlOperatingSystem = self.get(&url, &[("objectMask", "mask[passwords]")]).await?;
        let record = os
            .passwords
            .iter()
            .find(|p| p.username == credential.username)
            .ok_or_else(|| {
                CpiError::new(
                    ErrorKind::CredentialDisallowed,
                    format!(
                        "user '{}' does not exist on instance {}",
                        credential.username, cid
                    ),
                )
            })?;
        let url = self.url("SoftLayer_Software_Component_Password", Some(record.id), "editObject");
        let _: Value = self
            .post(&url, &json!({ "parameters": [{ "password": credential.password }] }))
            .await?;
        Ok(())
    }

    async fn reboot_instance(&self, cid: u64) -> CpiResult<()> {
        let url = self.url(GUEST_SERVICE, Some(cid), "rebootSoft");
        let ok: bool = self.get(&url, &[]).await?;
        if !ok {
            return Err(CpiError::cloud(format!("SoftLayer refused soft reboot of {}", cid)));
        }
        Ok(())
    }
}
