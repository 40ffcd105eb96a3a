#![warn(
    // Base lints.
    clippy::all,
    // Some pedantic lints.
    clippy::pedantic,
    // New lints which are cool.
    clippy::nursery,
)]
#![
    allow(
        // I don't care about this.
        clippy::module_name_repetitions,
        // Yo, the hell you should put
        // it in docs, if signature is clear as sky.
        clippy::missing_errors_doc
    )
]

use std::{sync::Arc, time::Duration};

use clap::Parser;
use config::OperatorConfig;
use csr::{CsrApprover, KubeCsrApprover};
use error::{CCMError, CCMResult};
use events::{EventPublisher, KubeEventPublisher};
use futures::StreamExt;
use index::SharedIndex;
use instances::InstanceResolver;
use k8s_openapi::api::{
    certificates::v1::CertificateSigningRequest,
    core::v1::{Node, Service},
};
use kube::{
    runtime::{controller, watcher, Controller},
    Api,
};
use lb::ReconcileEngine;
use linode::{
    client::{Configuration, LinodeClient},
    LinodeApi,
};
use retry::RetryPolicy;
use tokio::sync::watch;

pub mod config;
pub mod consts;
pub mod csr;
pub mod error;
pub mod events;
pub mod finalizers;
pub mod index;
pub mod instances;
pub mod label_filter;
pub mod lb;
pub mod linode;
pub mod retry;
pub mod services;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> CCMResult<()> {
    dotenvy::dotenv().ok();
    let operator_config = config::OperatorConfig::parse();
    tracing_subscriber::fmt()
        .with_max_level(operator_config.log_level)
        .init();

    tracing::info!("Starting linode-ccm v{}", env!("CARGO_PKG_VERSION"));
    let kube_client = kube::Client::try_default().await?;
    tracing::info!("Kube client is connected");

    // Flipped on ctrl-c so pending retries stop between attempts.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            stop_tx.send_replace(true);
        }
    });

    let mut linode_conf = Configuration::new(operator_config.linode_url.as_str());
    linode_conf.bearer_access_token = Some(operator_config.linode_token.clone());
    let linode: Arc<dyn LinodeApi> = Arc::new(LinodeClient::new(linode_conf));

    let context = Arc::new(CurrentContext::new(
        kube_client.clone(),
        operator_config.clone(),
        linode,
        stop_rx,
    ));

    tracing::info!("Starting the service controller");
    let service_controller = Controller::new(
        Api::<Service>::all(kube_client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(services::reconcile_service, services::on_error, context.clone())
    .for_each(|reconcilation_result| async move {
        match reconcilation_result {
            Ok((service, _action)) => {
                tracing::info!("Reconcilation of a service {} was successful", service.name);
            }
            Err(err) => match err {
                // During reconcilation process,
                // the controller has decided to skip the service.
                controller::Error::ReconcilerFailed(CCMError::SkipService, _) => {}
                _ => {
                    tracing::error!("Error reconciling service: {:#?}", err);
                }
            },
        }
    });

    let (run_nodes, run_csrs) = (operator_config.node_controller, operator_config.csr_approver);
    let node_controller = {
        let client = kube_client.clone();
        let context = context.clone();
        async move {
            if !run_nodes {
                return;
            }
            tracing::info!("Starting the node controller");
            Controller::new(Api::<Node>::all(client), watcher::Config::default())
                .shutdown_on_signal()
                .run(instances::reconcile_node, instances::on_error, context)
                .for_each(|result| async move {
                    if let Err(err) = result {
                        tracing::error!("Error reconciling node: {:#?}", err);
                    }
                })
                .await;
        }
    };

    let csr_controller = {
        let client = kube_client;
        let context = context.clone();
        async move {
            if !run_csrs {
                return;
            }
            tracing::info!("Starting the CSR approver");
            Controller::new(
                Api::<CertificateSigningRequest>::all(client),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(csr::reconcile_csr, csr::on_error, context)
            .for_each(|result| async move {
                if let Err(err) = result {
                    tracing::error!("Error handling CSR: {:#?}", err);
                }
            })
            .await;
        }
    };

    tokio::join!(service_controller, node_controller, csr_controller);
    tracing::info!("All controllers stopped");
    Ok(())
}

pub struct CurrentContext {
    pub client: kube::Client,
    pub config: OperatorConfig,
    pub engine: ReconcileEngine<dyn LinodeApi>,
    pub instances: InstanceResolver,
    pub events: Arc<dyn EventPublisher>,
    pub csr_approver: Arc<dyn CsrApprover>,
    pub csr_retry: RetryPolicy,
}

impl CurrentContext {
    #[must_use]
    pub fn new(
        client: kube::Client,
        config: OperatorConfig,
        linode: Arc<dyn LinodeApi>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let api_retry = config.api_retry_policy().with_stop(stop.clone());
        Self {
            engine: ReconcileEngine::new(linode.clone(), SharedIndex::default(), api_retry.clone()),
            instances: InstanceResolver::new(linode, api_retry),
            events: Arc::new(KubeEventPublisher::new(
                client.clone(),
                consts::CONTROLLER_NAME,
            )),
            csr_approver: Arc::new(KubeCsrApprover::new(client.clone())),
            csr_retry: RetryPolicy::new(
                consts::CSR_APPROVAL_ATTEMPTS,
                Duration::from_millis(consts::CSR_APPROVAL_DELAY_MS),
            )
            .with_stop(stop),
            client,
            config,
        }
    }
}
