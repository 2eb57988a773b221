use std::sync::Arc;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

use cumulus_common::{
    Account, Error, Host, HostAssociation, HostKind, PoolAssociation, PoolHost, Presence, Result,
    StoragePool, Template, UsageEvent, Vm, Volume, Zone,
};
use cumulus_meta::MetaStore;

use crate::monitor::ExtractUrl;

/// Typed access to every record the orchestrator reads or writes.
///
/// One key family per record type; values are serde JSON. All store access in
/// the workspace funnels through here so key layout lives in one place.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn MetaStore>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .context("serializing record")
        .map_err(Error::Store)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .context("deserializing record")
        .map_err(Error::Store)
}

impl Catalog {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    fn template_key(id: &str) -> String {
        format!("/templates/{id}")
    }

    fn zone_key(id: &str) -> String {
        format!("/zones/{id}")
    }

    fn pool_key(id: &str) -> String {
        format!("/pools/{id}")
    }

    fn host_key(id: &str) -> String {
        format!("/hosts/{id}")
    }

    fn account_key(id: &str) -> String {
        format!("/accounts/{id}")
    }

    fn vm_key(id: &str) -> String {
        format!("/vms/{id}")
    }

    fn volume_key(id: &str) -> String {
        format!("/volumes/{id}")
    }

    fn pool_assoc_key(pool_id: &str, template_id: &str) -> String {
        format!("/pool_assocs/{pool_id}/{template_id}")
    }

    fn host_assoc_key(host_id: &str, template_id: &str) -> String {
        format!("/host_assocs/{host_id}/{template_id}")
    }

    fn pool_host_key(pool_id: &str, host_id: &str) -> String {
        format!("/pool_hosts/{pool_id}/{host_id}")
    }

    fn template_zone_key(zone_id: &str, template_id: &str) -> String {
        format!("/template_zones/{zone_id}/{template_id}")
    }

    fn usage_event_key(event_id: &str) -> String {
        format!("/usage_events/{event_id}")
    }

    fn extract_url_key(url_id: &str) -> String {
        format!("/extract_urls/{url_id}")
    }

    async fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await.map_err(Error::Store)? {
            Some((bytes, _)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store
            .put(key, encode(value)?)
            .await
            .map_err(Error::Store)?;
        Ok(())
    }

    async fn list_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (_, bytes, _) in self.store.list_prefix(prefix).await.map_err(Error::Store)? {
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    // ── Templates ────────────────────────────────────────────────────

    pub async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        self.get_record(&Self::template_key(template_id)).await
    }

    pub async fn put_template(&self, template: &Template) -> Result<()> {
        self.put_record(&Self::template_key(&template.template_id), template)
            .await
    }

    pub async fn add_template_to_zone(&self, template_id: &str, zone_id: &str) -> Result<()> {
        self.store
            .put(
                &Self::template_zone_key(zone_id, template_id),
                template_id.as_bytes().to_vec(),
            )
            .await
            .map_err(Error::Store)?;
        Ok(())
    }

    // ── Topology ─────────────────────────────────────────────────────

    pub async fn get_zone(&self, zone_id: &str) -> Result<Option<Zone>> {
        self.get_record(&Self::zone_key(zone_id)).await
    }

    pub async fn put_zone(&self, zone: &Zone) -> Result<()> {
        self.put_record(&Self::zone_key(&zone.zone_id), zone).await
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Option<StoragePool>> {
        self.get_record(&Self::pool_key(pool_id)).await
    }

    pub async fn put_pool(&self, pool: &StoragePool) -> Result<()> {
        self.put_record(&Self::pool_key(&pool.pool_id), pool).await
    }

    pub async fn list_pools(&self) -> Result<Vec<StoragePool>> {
        self.list_records("/pools/").await
    }

    pub async fn get_host(&self, host_id: &str) -> Result<Option<Host>> {
        self.get_record(&Self::host_key(host_id)).await
    }

    pub async fn put_host(&self, host: &Host) -> Result<()> {
        self.put_record(&Self::host_key(&host.host_id), host).await
    }

    pub async fn secondary_hosts_in_zone(&self, zone_id: &str) -> Result<Vec<Host>> {
        let hosts: Vec<Host> = self.list_records("/hosts/").await?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.zone_id == zone_id && h.kind == HostKind::SecondaryStorage)
            .collect())
    }

    pub async fn put_pool_host(&self, attachment: &PoolHost) -> Result<()> {
        self.put_record(
            &Self::pool_host_key(&attachment.pool_id, &attachment.host_id),
            attachment,
        )
        .await
    }

    /// Hosts attached to a pool, in key (listing) order.
    pub async fn pool_hosts(&self, pool_id: &str) -> Result<Vec<PoolHost>> {
        self.list_records(&format!("/pool_hosts/{pool_id}/")).await
    }

    // ── Accounts / VMs / volumes ─────────────────────────────────────

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        self.get_record(&Self::account_key(account_id)).await
    }

    pub async fn put_account(&self, account: &Account) -> Result<()> {
        self.put_record(&Self::account_key(&account.account_id), account)
            .await
    }

    pub async fn get_vm(&self, vm_id: &str) -> Result<Option<Vm>> {
        self.get_record(&Self::vm_key(vm_id)).await
    }

    pub async fn put_vm(&self, vm: &Vm) -> Result<()> {
        self.put_record(&Self::vm_key(&vm.vm_id), vm).await
    }

    /// Non-expunged VMs in a zone created from a template.
    pub async fn live_vms_from_template(
        &self,
        zone_id: &str,
        template_id: &str,
    ) -> Result<Vec<Vm>> {
        let vms: Vec<Vm> = self.list_records("/vms/").await?;
        Ok(vms
            .into_iter()
            .filter(|vm| {
                vm.zone_id == zone_id
                    && vm.template_id.as_deref() == Some(template_id)
                    && !vm.is_expunged()
            })
            .collect())
    }

    pub async fn put_volume(&self, volume: &Volume) -> Result<()> {
        self.put_record(&Self::volume_key(&volume.volume_id), volume)
            .await
    }

    pub async fn any_volume_using_template_in_pool(
        &self,
        template_id: &str,
        pool_id: &str,
    ) -> Result<bool> {
        let volumes: Vec<Volume> = self.list_records("/volumes/").await?;
        Ok(volumes.iter().any(|v| {
            v.pool_id == pool_id && v.template_id.as_deref() == Some(template_id) && !v.removed
        }))
    }

    // ── Pool associations ────────────────────────────────────────────

    pub async fn pool_assoc(
        &self,
        pool_id: &str,
        template_id: &str,
    ) -> Result<Option<PoolAssociation>> {
        self.get_record(&Self::pool_assoc_key(pool_id, template_id))
            .await
    }

    /// Create a pool association only if none exists. Returns false when a
    /// concurrent caller won the create race.
    pub async fn try_create_pool_assoc(&self, assoc: &PoolAssociation) -> Result<bool> {
        let key = Self::pool_assoc_key(&assoc.pool_id, &assoc.template_id);
        let (created, _) = self
            .store
            .compare_and_swap(&key, 0, encode(assoc)?)
            .await
            .map_err(Error::Store)?;
        Ok(created)
    }

    pub async fn save_pool_assoc(&self, assoc: &PoolAssociation) -> Result<()> {
        self.put_record(
            &Self::pool_assoc_key(&assoc.pool_id, &assoc.template_id),
            assoc,
        )
        .await
    }

    pub async fn remove_pool_assoc(&self, pool_id: &str, template_id: &str) -> Result<bool> {
        self.store
            .delete(&Self::pool_assoc_key(pool_id, template_id))
            .await
            .map_err(Error::Store)
    }

    pub async fn pool_assocs(&self, pool_id: &str) -> Result<Vec<PoolAssociation>> {
        self.list_records(&format!("/pool_assocs/{pool_id}/")).await
    }

    // ── Host associations ────────────────────────────────────────────

    pub async fn host_assoc(
        &self,
        host_id: &str,
        template_id: &str,
    ) -> Result<Option<HostAssociation>> {
        self.get_record(&Self::host_assoc_key(host_id, template_id))
            .await
    }

    pub async fn save_host_assoc(&self, assoc: &HostAssociation) -> Result<()> {
        self.put_record(
            &Self::host_assoc_key(&assoc.host_id, &assoc.template_id),
            assoc,
        )
        .await
    }

    pub async fn host_assocs_for_template(
        &self,
        template_id: &str,
    ) -> Result<Vec<HostAssociation>> {
        let assocs: Vec<HostAssociation> = self.list_records("/host_assocs/").await?;
        Ok(assocs
            .into_iter()
            .filter(|a| a.template_id == template_id)
            .collect())
    }

    /// First secondary host in a zone holding a complete, live copy of the
    /// template. Hosts in the requested pod are preferred.
    pub async fn ready_host_assoc_in_zone(
        &self,
        template_id: &str,
        zone_id: &str,
        pod_id: Option<&str>,
    ) -> Result<Option<(HostAssociation, Host)>> {
        let mut fallback = None;
        for host in self.secondary_hosts_in_zone(zone_id).await? {
            let Some(assoc) = self.host_assoc(&host.host_id, template_id).await? else {
                continue;
            };
            if !assoc.is_ready() {
                continue;
            }
            if pod_id.is_some() && host.pod_id.as_deref() == pod_id {
                return Ok(Some((assoc, host)));
            }
            if fallback.is_none() {
                fallback = Some((assoc, host));
            }
        }
        Ok(fallback)
    }

    /// Any live association for the template on a secondary host in the
    /// zone, regardless of download state.
    pub async fn host_assoc_in_zone(
        &self,
        template_id: &str,
        zone_id: &str,
    ) -> Result<Option<(HostAssociation, Host)>> {
        for host in self.secondary_hosts_in_zone(zone_id).await? {
            if let Some(assoc) = self.host_assoc(&host.host_id, template_id).await? {
                if assoc.presence == Presence::Active {
                    return Ok(Some((assoc, host)));
                }
            }
        }
        Ok(None)
    }

    // ── Usage events / extraction URLs ───────────────────────────────

    pub async fn record_usage_event(&self, event: &UsageEvent) -> Result<()> {
        self.put_record(&Self::usage_event_key(&event.event_id), event)
            .await
    }

    pub async fn list_usage_events(&self) -> Result<Vec<UsageEvent>> {
        self.list_records("/usage_events/").await
    }

    pub async fn save_extract_url(&self, entry: &ExtractUrl) -> Result<()> {
        self.put_record(&Self::extract_url_key(&entry.url_id), entry)
            .await
    }
}
