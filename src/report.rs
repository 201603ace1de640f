//! Result reporting
//!
//! Every session opens with a "connected" report whose returned id tags all
//! later updates. Reporting never fails the caller: any problem is logged and
//! the id degrades to `"0"`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{ResultReport, ServerClient};
use crate::identity::AgentIdentity;
use crate::session::{peer_ip, ProtocolKind, Session, UNASSIGNED_ID};

#[derive(Clone)]
pub struct Reporter {
    client: ServerClient,
    identity: Arc<AgentIdentity>,
}

impl Reporter {
    pub fn new(client: ServerClient, identity: AgentIdentity) -> Self {
        Self {
            client,
            identity: Arc::new(identity),
        }
    }

    pub fn client(&self) -> &ServerClient {
        &self.client
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Send one report. `existing_id == "0"` creates a record, anything else
    /// updates it. Returns the server's id, or `"0"` on any failure.
    pub async fn report_result(
        &self,
        kind: ProtocolKind,
        name: &str,
        source_ip: &str,
        info: &str,
        existing_id: &str,
    ) -> String {
        let report = ResultReport {
            agent_ip: self.identity.agent_ip.clone(),
            agent_name: self.identity.agent_name.clone(),
            hostname: self.identity.hostname.clone(),
            node_type: self.identity.node_type.clone(),
            kind: kind.as_str().to_string(),
            project_name: name.to_string(),
            source_ip: source_ip.to_string(),
            info: info.to_string(),
            id: existing_id.to_string(),
        };

        match self.client.post_result(&report).await {
            Ok(id) if !id.is_empty() => {
                debug!("{} report accepted for {}: id {}", kind, source_ip, id);
                id
            }
            Ok(_) => UNASSIGNED_ID.to_string(),
            Err(e) => {
                let target = if source_ip.is_empty() { "127.0.0.1" } else { source_ip };
                warn!("{} report failed for {}: {}", kind, target, e);
                UNASSIGNED_ID.to_string()
            }
        }
    }

    /// Report a new connection and build its session
    pub async fn open_session(&self, kind: ProtocolKind, name: &str, peer: &str) -> Session {
        let info = format!("{} connected", peer);
        let id = self
            .report_result(kind, name, peer_ip(peer), &info, UNASSIGNED_ID)
            .await;
        Session::new(kind, name, peer, id)
    }

    /// Fire-and-forget update tagged with the session's id
    pub fn spawn_update(&self, session: &Session, info: impl Into<String>) {
        let reporter = self.clone();
        let kind = session.kind;
        let name = session.name.clone();
        let id = session.id().to_string();
        let info = info.into();
        tokio::spawn(async move {
            reporter.report_result(kind, &name, "", &info, &id).await;
        });
    }

    /// Fire-and-forget standalone report for protocols without sessions
    pub fn spawn_created(&self, kind: ProtocolKind, name: &str, source_ip: &str, info: impl Into<String>) {
        let reporter = self.clone();
        let name = name.to_string();
        let source_ip = source_ip.to_string();
        let info = info.into();
        tokio::spawn(async move {
            reporter
                .report_result(kind, &name, &source_ip, &info, UNASSIGNED_ID)
                .await;
        });
    }
}
