use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    error::{CCMError, CCMResult},
    index::SharedIndex,
    linode::{
        models::{BalancerId, NodeBalancer, NodeBalancerCreateOptions, NodeBalancerUpdateOptions},
        Filter, LinodeApi, LinodeResult,
    },
    retry::RetryPolicy,
};

use super::{
    call,
    desired::{DesiredPort, DesiredService},
    differ, ignore_not_found,
    nodes::NodeSetSync,
};

/// Where the balancer id of a service, and the TLS digests applied to it,
/// are remembered between reconciles and controller restarts.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn persist_balancer_id(&self, id: BalancerId) -> CCMResult<()>;
    /// An empty map clears the record.
    async fn persist_tls_digests(&self, digests: &BTreeMap<u16, String>) -> CCMResult<()>;
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub balancer: NodeBalancer,
    pub created: bool,
    /// Mutating API calls issued during the pass.
    pub mutations: usize,
}

/// Converges NodeBalancers to desired service state.
///
/// Callers must not run two reconciles for the same service at once; the
/// kube controller already serialises reconciles per object.
pub struct ReconcileEngine<A: LinodeApi + ?Sized> {
    api: Arc<A>,
    index: SharedIndex,
    retry: RetryPolicy,
}

impl<A: LinodeApi + ?Sized> ReconcileEngine<A> {
    pub const fn new(api: Arc<A>, index: SharedIndex, retry: RetryPolicy) -> Self {
        Self { api, index, retry }
    }

    #[must_use]
    pub const fn index(&self) -> &SharedIndex {
        &self.index
    }

    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> CCMResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LinodeResult<T>>,
    {
        call(&self.retry, operation, op).await
    }

    /// Bring the balancer of `desired` to its desired state.
    ///
    /// Validation happens before the first remote call. The balancer id is
    /// handed to `identity` as soon as it is known, before any config work.
    #[tracing::instrument(skip_all, fields(service = %desired.key()))]
    pub async fn reconcile(
        &self,
        desired: &DesiredService,
        identity: &dyn IdentityStore,
    ) -> CCMResult<ReconcileReport> {
        desired.validate()?;
        let api = &*self.api;
        let mut mutations = 0;

        let (mut balancer, created) = match self.find(desired).await? {
            Some(balancer) => (balancer, false),
            None => {
                mutations += 1;
                (self.create(desired).await?, true)
            }
        };
        let balancer_id = balancer.id;
        if desired.balancer_id != Some(balancer_id) {
            identity.persist_balancer_id(balancer_id).await?;
        }

        let observed = self
            .call("list_configs", move || api.list_configs(balancer_id))
            .await?;
        let ports = observed
            .iter()
            .map(|config| (config.id, config.port))
            .collect::<Vec<_>>();
        let applied_tls = self.index.with(|index| {
            index.sync_configs(balancer_id, &ports);
            for port in &desired.ports {
                let Some(config) = index.config_for_port(balancer_id, port.port) else {
                    continue;
                };
                if created {
                    index.set_tls_digest(config, port.tls_digest());
                } else if index.tls_digest(config).is_none() {
                    // Nothing in memory yet (fresh process): trust the service.
                    if let Some(digest) = desired.applied_tls.get(&port.port) {
                        index.set_tls_digest(config, Some(digest.clone()));
                    }
                }
            }
            ports
                .iter()
                .filter_map(|(config, _)| {
                    index
                        .tls_digest(*config)
                        .map(|digest| (*config, digest.to_string()))
                })
                .collect::<HashMap<_, _>>()
        });

        let plan = differ::diff(&desired.ports, &observed, &applied_tls)?;
        mutations += plan.mutations();
        let mut targets = plan.keep.clone();

        for port in &plan.create {
            let options = port.create_options();
            let options = &options;
            let config = self
                .call("create_config", move || api.create_config(balancer_id, options))
                .await?;
            tracing::info!(config = config.id, port = config.port, "Config created");
            self.index.with(|index| {
                index.insert_config(balancer_id, config.id, config.port);
                index.set_tls_digest(config.id, port.tls_digest());
            });
            targets.push((config.id, *port));
        }
        for (config_id, port) in &plan.update {
            let config_id = *config_id;
            let options = port.update_options();
            let options = &options;
            self.call("update_config", move || {
                api.update_config(balancer_id, config_id, options)
            })
            .await?;
            tracing::info!(config = config_id, port = port.port, "Config updated");
            targets.push((config_id, *port));
        }
        for (config_id, port) in &plan.rebuild {
            let config_id = *config_id;
            let options = port.with_nodes();
            let options = &options;
            self.call("rebuild_config", move || {
                api.rebuild_config(balancer_id, config_id, options)
            })
            .await?;
            tracing::info!(config = config_id, port = port.port, "Config rebuilt");
            self.index
                .with(|index| index.set_tls_digest(config_id, port.tls_digest()));
            targets.push((config_id, *port));
        }
        for config_id in &plan.delete {
            let config_id = *config_id;
            ignore_not_found(
                self.call("delete_config", move || {
                    api.delete_config(balancer_id, config_id)
                })
                .await,
            )?;
            tracing::info!(config = config_id, "Config deleted");
            self.index.with(|index| index.remove_config(config_id));
        }

        let nodes = NodeSetSync {
            api,
            retry: &self.retry,
            index: &self.index,
        };
        for (config_id, port) in targets {
            mutations += nodes.sync(balancer_id, config_id, &port.nodes).await?;
        }

        let update = balancer_update(&balancer, desired);
        if !update.is_empty() {
            let update = &update;
            balancer = self
                .call("update_nodebalancer", move || {
                    api.update_nodebalancer(balancer_id, update)
                })
                .await?;
            tracing::info!(balancer = balancer_id, "NodeBalancer updated");
            mutations += 1;
        }

        let digests = self.index.with(|index| {
            desired
                .ports
                .iter()
                .filter_map(|port| {
                    let config = index.config_for_port(balancer_id, port.port)?;
                    index
                        .tls_digest(config)
                        .map(|digest| (port.port, digest.to_string()))
                })
                .collect::<BTreeMap<_, _>>()
        });
        if digests != desired.applied_tls {
            identity.persist_tls_digests(&digests).await?;
        }

        Ok(ReconcileReport {
            balancer,
            created,
            mutations,
        })
    }

    /// Delete the balancer of a service together with everything under it.
    ///
    /// When the recorded id is unknown or already gone the balancer is looked
    /// up by label, so one created under a lost identity is not leaked.
    /// Returns the id that was removed, or the recorded one if nothing was
    /// left to remove.
    pub async fn delete(
        &self,
        balancer_id: Option<BalancerId>,
        label: &str,
    ) -> CCMResult<Option<BalancerId>> {
        if let Some(id) = balancer_id {
            if self.delete_balancer(id).await? {
                return Ok(Some(id));
            }
            tracing::warn!(
                balancer = id,
                "Recorded NodeBalancer no longer exists, looking it up by label"
            );
        }
        let Some(found) = self.find_by_label(label).await? else {
            return Ok(balancer_id);
        };
        self.delete_balancer(found.id).await?;
        Ok(Some(found.id))
    }

    /// Returns `false` when the balancer was already gone.
    async fn delete_balancer(&self, id: BalancerId) -> CCMResult<bool> {
        let api = &*self.api;
        let existed = match self
            .call("delete_nodebalancer", move || api.delete_nodebalancer(id))
            .await
        {
            Ok(()) => true,
            Err(CCMError::LinodeError(err)) if err.is_not_found() => false,
            Err(err) => return Err(err),
        };
        if existed {
            tracing::info!(balancer = id, "NodeBalancer deleted");
        }
        self.index.with(|index| index.remove_balancer(id));
        Ok(existed)
    }

    async fn find(&self, desired: &DesiredService) -> CCMResult<Option<NodeBalancer>> {
        if let Some(id) = desired.balancer_id {
            let api = &*self.api;
            match self
                .call("get_nodebalancer", move || api.get_nodebalancer(id))
                .await
            {
                Ok(balancer) => return Ok(Some(balancer)),
                Err(CCMError::LinodeError(err)) if err.is_not_found() => {
                    tracing::warn!(
                        balancer = id,
                        "Recorded NodeBalancer no longer exists, looking it up by label"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        let mut found = self.find_by_label(&desired.label).await?;
        if found.is_none() {
            if let Some(ip) = &desired.ingress_ip {
                // The label annotation may have changed since the balancer
                // was created; its address still identifies it.
                found = self.find_one(&Filter::ipv4(ip.as_str()), "address", ip).await?;
            }
        }
        if let Some(balancer) = &found {
            tracing::info!(balancer = balancer.id, label = %desired.label, "Adopting NodeBalancer");
        }
        Ok(found)
    }

    async fn find_by_label(&self, label: &str) -> CCMResult<Option<NodeBalancer>> {
        self.find_one(&Filter::label(label), "label", label).await
    }

    async fn find_one(
        &self,
        filter: &Filter,
        field: &str,
        value: &str,
    ) -> CCMResult<Option<NodeBalancer>> {
        let api = &*self.api;
        let mut found = self
            .call("list_nodebalancers", move || api.list_nodebalancers(filter))
            .await?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(CCMError::Validation(format!(
                "{n} NodeBalancers match {field} {value}, refusing to pick one"
            ))),
        }
    }

    async fn create(&self, desired: &DesiredService) -> CCMResult<NodeBalancer> {
        let options = NodeBalancerCreateOptions {
            label: desired.label.clone(),
            region: desired.region.clone(),
            client_conn_throttle: desired.throttle,
            tags: desired.tags.clone(),
            configs: desired.ports.iter().map(DesiredPort::with_nodes).collect(),
        };
        let api = &*self.api;
        let options = &options;
        let balancer = self
            .call("create_nodebalancer", move || api.create_nodebalancer(options))
            .await?;
        tracing::info!(
            balancer = balancer.id,
            label = %desired.label,
            region = %desired.region,
            "NodeBalancer created"
        );
        self.index.with(|index| index.insert_balancer(balancer.id));
        Ok(balancer)
    }
}

/// Fields of the balancer itself that drifted from the desired state.
fn balancer_update(balancer: &NodeBalancer, desired: &DesiredService) -> NodeBalancerUpdateOptions {
    if balancer.region != desired.region {
        tracing::warn!(
            balancer = balancer.id,
            current = %balancer.region,
            wanted = %desired.region,
            "NodeBalancer region cannot be changed in place"
        );
    }
    let mut tags = balancer.tags.clone();
    tags.sort();
    tags.dedup();
    NodeBalancerUpdateOptions {
        label: (balancer.label.as_deref() != Some(desired.label.as_str()))
            .then(|| desired.label.clone()),
        client_conn_throttle: (balancer.client_conn_throttle != desired.throttle)
            .then_some(desired.throttle),
        tags: (tags != desired.tags).then(|| desired.tags.clone()),
    }
}
