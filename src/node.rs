use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::network::discovery::DiscoveryBeacon;
use crate::network::serve;
use crate::store::{NewUser, Store};

/// A coordinator with its listener, discovery beacon and dashboard.
pub struct Node {
    coordinator: Coordinator,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl Node {
    /// Bind the TCP listener. Nothing runs until [`Node::run`].
    pub async fn bind(
        config: CoordinatorConfig,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let coordinator = Coordinator::new(config, store, cancel.clone());
        Ok(Self {
            coordinator,
            listener,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.coordinator.handle()
    }

    /// Run every subsystem until shutdown.
    ///
    /// The reactor runs on this task. The listener, the discovery beacon and
    /// the dashboard are spawned and stopped through the cancellation token
    /// once the reactor returns.
    pub async fn run(self) -> Result<()> {
        let config = self.coordinator.config().clone();
        let handle = self.coordinator.handle();

        tokio::spawn(serve(
            self.listener,
            handle.events(),
            config.spool_dir(),
            self.cancel.clone(),
        ));

        if let Some(discovery) = &config.discovery {
            match DiscoveryBeacon::bind(discovery).await {
                Ok(beacon) => {
                    tokio::spawn(beacon.run(self.cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!(group = %discovery.group, port = discovery.port, error = %e, "Discovery beacon disabled");
                }
            }
        }

        if let Some(dashboard_addr) = config.dashboard_addr {
            let state = DashboardState {
                coordinator: handle.clone(),
            };
            tokio::spawn(run_dashboard(dashboard_addr, state, self.cancel.clone()));
        }

        let result = self.coordinator.run().await;
        self.cancel.cancel();
        result
    }
}

/// Make sure `email` exists and is an administrator.
pub fn ensure_admin(store: &dyn Store, email: &str) -> Result<()> {
    match store.user_by_email(email)? {
        Some(user) if user.admin => Ok(()),
        Some(user) => {
            tracing::warn!(user = %user.email, "Existing user is not an administrator");
            Ok(())
        }
        None => {
            let user = store.add_user(NewUser {
                email: email.to_string(),
                admin: true,
                ..Default::default()
            })?;
            tracing::info!(user = %user.email, "Administrator created");
            Ok(())
        }
    }
}
