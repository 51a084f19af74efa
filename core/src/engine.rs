//! Gateway engine
//!
//! Owns the listening socket and runs one task per client session. Each
//! session decodes LDAP messages, answers binds through the configured
//! [`AuthProvider`] (plus optional step-up approval) and answers searches by
//! classifying the filter and projecting [`DirectoryProvider`] records.

use crate::classify::{classify_filter, has_group_discriminator, RequestIntent};
use crate::entry::{project_group, project_user, ProtocolEntry};
use crate::error::{GatewayError, ProviderError};
use crate::events::{EntryKind, EventBus, GatewayEvent};
use crate::filter::Filter;
use crate::metrics::{Metrics, OperationGuard};
use crate::model::{BindContext, Credential};
use crate::provider::{AuthProvider, DirectoryProvider};
use crate::stepup::{StepUpError, StepUpNotifier, StepUpOutcome};
use crate::tls::TlsMaterial;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use ldap3_proto::proto::{LdapMsg, LdapOp, LdapResultCode, LdapSearchScope};
use ldap3_proto::simple::{DisconnectionNotice, SearchRequest, ServerOps, SimpleBindRequest};
use ldap3_proto::LdapCodec;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const VENDOR_NAME: &str = "ldap-gateway";

/// Listener configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_dn: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub tls: Option<TlsMaterial>,
}

impl EngineConfig {
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dn: "dc=localhost".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 389,
            tls: None,
        }
    }
}

pub struct GatewayEngine {
    config: EngineConfig,
    auth: Option<Arc<dyn AuthProvider>>,
    directory: Option<Arc<dyn DirectoryProvider>>,
    step_up: Option<Arc<StepUpNotifier>>,
    metrics: Arc<Metrics>,
    events: EventBus,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl GatewayEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            auth: None,
            directory: None,
            step_up: None,
            metrics: Arc::new(Metrics::default()),
            events: EventBus::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
        }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn with_directory_provider(mut self, provider: Arc<dyn DirectoryProvider>) -> Self {
        self.directory = Some(provider);
        self
    }

    pub fn with_step_up(mut self, notifier: StepUpNotifier) -> Self {
        self.step_up = Some(Arc::new(notifier));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<(), GatewayError> {
        if self.local_addr.is_some() {
            return Err(GatewayError::Configuration(
                "gateway is already running".to_string(),
            ));
        }
        let auth = self.auth.clone().ok_or_else(|| {
            GatewayError::Configuration("an auth provider must be set before start".to_string())
        })?;
        let directory = self.directory.clone().ok_or_else(|| {
            GatewayError::Configuration(
                "a directory provider must be set before start".to_string(),
            )
        })?;

        let acceptor = match &self.config.tls {
            Some(material) => Some(material.acceptor()?),
            None => {
                warn!("No TLS material configured, serving plain LDAP");
                None
            }
        };

        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::from_listen_error(&e, self.config.port))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Startup(e.to_string()))?;

        self.shutdown = CancellationToken::new();
        self.tracker = TaskTracker::new();

        let handler = Arc::new(RequestHandler {
            base_dn: self.config.base_dn.clone(),
            auth,
            directory,
            step_up: self.step_up.clone(),
            metrics: self.metrics.clone(),
            events: self.events.clone(),
        });

        let tls = acceptor.is_some();
        self.tracker.spawn(accept_loop(
            listener,
            acceptor,
            handler,
            self.shutdown.clone(),
            self.tracker.clone(),
        ));
        self.local_addr = Some(local_addr);

        info!(
            "LDAP gateway listening on {} ({}), base DN {}",
            local_addr,
            if tls { "ldaps" } else { "ldap" },
            self.config.base_dn
        );
        self.events.emit(GatewayEvent::Started {
            port: local_addr.port(),
            tls,
        });
        Ok(())
    }

    /// Stop accepting and wait for in-flight operations to finish.
    pub async fn stop(&mut self) {
        if self.local_addr.take().is_none() {
            return;
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("LDAP gateway stopped");
        self.events.emit(GatewayEvent::Stopped);
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        handler.metrics.connections_total.inc();
        debug!("Connection from {}", peer);

        let handler = handler.clone();
        let shutdown = shutdown.clone();
        match acceptor.clone() {
            None => {
                tracker.spawn(serve_session(handler, stream, peer, false, shutdown));
            }
            Some(acceptor) => {
                tracker.spawn(async move {
                    let handshake =
                        tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
                    match handshake {
                        Ok(Ok(tls_stream)) => {
                            handler
                                .metrics
                                .tls_handshakes_total
                                .with_label_values(&["success"])
                                .inc();
                            serve_session(handler, tls_stream, peer, true, shutdown).await;
                        }
                        Ok(Err(e)) => {
                            handler
                                .metrics
                                .tls_handshakes_total
                                .with_label_values(&["failure"])
                                .inc();
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            handler.events.emit(GatewayEvent::ClientError {
                                peer: Some(peer),
                                error: e.to_string(),
                            });
                        }
                        Err(_) => {
                            handler
                                .metrics
                                .tls_handshakes_total
                                .with_label_values(&["timeout"])
                                .inc();
                            warn!("TLS handshake with {} timed out", peer);
                        }
                    }
                });
            }
        }
    }
    debug!("Accept loop finished");
}

async fn serve_session<S>(
    handler: Arc<RequestHandler>,
    stream: S,
    peer: SocketAddr,
    tls: bool,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    handler.metrics.sessions_active.inc();
    let (reader, writer) = tokio::io::split(stream);
    let mut requests = FramedRead::new(reader, LdapCodec::default());
    let mut responses = FramedWrite::new(writer, LdapCodec::default());
    let mut bound_dn = String::new();

    loop {
        // Only an idle session is interrupted by shutdown
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = requests.next() => next,
        };
        let msg = match next {
            None => break,
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("Protocol error from {}: {}", peer, e);
                handler.events.emit(GatewayEvent::ClientError {
                    peer: Some(peer),
                    error: e.to_string(),
                });
                break;
            }
        };

        let op = match ServerOps::try_from(msg) {
            Ok(op) => op,
            Err(_) => {
                debug!("Unsupported operation from {}, disconnecting", peer);
                let notice = DisconnectionNotice::gen(
                    LdapResultCode::UnwillingToPerform,
                    "Unsupported operation",
                );
                if let Err(e) = responses.send(notice).await {
                    debug!("Disconnection notice to {} failed: {}", peer, e);
                }
                break;
            }
        };

        let result = match op {
            ServerOps::SimpleBind(req) => {
                let context = BindContext {
                    dn: req.dn.clone(),
                    peer: Some(peer),
                    tls,
                };
                let response = handler.handle_bind(&req, &context).await;
                if response_is_success(&response) {
                    bound_dn = req.dn.clone();
                }
                responses.send(response).await
            }
            ServerOps::Search(req) => handler.handle_search(&req, &mut responses).await,
            ServerOps::Unbind(_) => break,
            ServerOps::Whoami(req) => {
                let authz = if bound_dn.is_empty() {
                    String::new()
                } else {
                    format!("dn: {}", bound_dn)
                };
                responses.send(req.gen_success(&authz)).await
            }
            #[allow(unreachable_patterns)]
            _ => {
                let notice = DisconnectionNotice::gen(
                    LdapResultCode::UnwillingToPerform,
                    "Unsupported operation",
                );
                if let Err(e) = responses.send(notice).await {
                    debug!("Disconnection notice to {} failed: {}", peer, e);
                }
                break;
            }
        };

        if let Err(e) = result {
            debug!("Write to {} failed: {}", peer, e);
            break;
        }
    }

    handler.metrics.sessions_active.dec();
    debug!("Session with {} closed", peer);
}

fn response_is_success(msg: &LdapMsg) -> bool {
    matches!(&msg.op, LdapOp::BindResponse(resp) if resp.res.code == LdapResultCode::Success)
}

/// Destination for the messages of one response.
#[async_trait]
pub trait ResponseSink: Send {
    async fn send_message(&mut self, msg: LdapMsg) -> io::Result<()>;
}

#[async_trait]
impl<W> ResponseSink for FramedWrite<W, LdapCodec>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send_message(&mut self, msg: LdapMsg) -> io::Result<()> {
        self.send(msg).await
    }
}

#[async_trait]
impl ResponseSink for Vec<LdapMsg> {
    async fn send_message(&mut self, msg: LdapMsg) -> io::Result<()> {
        self.push(msg);
        Ok(())
    }
}

enum SearchFailure {
    Provider(ProviderError),
    Client(io::Error),
}

impl From<ProviderError> for SearchFailure {
    fn from(e: ProviderError) -> Self {
        SearchFailure::Provider(e)
    }
}

/// Protocol-independent bind and search semantics, shared by all sessions.
pub struct RequestHandler {
    base_dn: String,
    auth: Arc<dyn AuthProvider>,
    directory: Arc<dyn DirectoryProvider>,
    step_up: Option<Arc<StepUpNotifier>>,
    metrics: Arc<Metrics>,
    events: EventBus,
}

impl RequestHandler {
    pub fn new(
        base_dn: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        directory: Arc<dyn DirectoryProvider>,
    ) -> Self {
        Self {
            base_dn: base_dn.into(),
            auth,
            directory,
            step_up: None,
            metrics: Arc::new(Metrics::default()),
            events: EventBus::new(),
        }
    }

    pub fn with_step_up(mut self, notifier: StepUpNotifier) -> Self {
        self.step_up = Some(Arc::new(notifier));
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub async fn handle_bind(&self, req: &SimpleBindRequest, context: &BindContext) -> LdapMsg {
        let guard = OperationGuard::new(self.metrics.clone(), "bind");
        self.events.emit(GatewayEvent::BindRequest {
            dn: req.dn.clone(),
            peer: context.peer,
        });

        if req.dn.is_empty() && req.pw.is_empty() {
            debug!("Anonymous bind");
            guard.finish_bind("anonymous");
            self.events.emit(GatewayEvent::BindSuccess { dn: String::new() });
            return req.gen_success();
        }

        match self.authenticate(req, context).await {
            Ok(()) => {
                info!("Bind succeeded for {}", req.dn);
                guard.finish_bind("success");
                self.events.emit(GatewayEvent::BindSuccess { dn: req.dn.clone() });
                req.gen_success()
            }
            Err(GatewayError::InvalidCredentials) => {
                info!("Bind rejected for {}", req.dn);
                guard.finish_bind("invalid_credentials");
                self.events.emit(GatewayEvent::BindFail {
                    dn: req.dn.clone(),
                    reason: "invalid credentials".to_string(),
                });
                req.gen_invalid_cred()
            }
            Err(e) => {
                error!("Bind error for {}: {}", req.dn, e);
                guard.finish_bind("error");
                self.events.emit(GatewayEvent::BindError {
                    dn: req.dn.clone(),
                    error: e.to_string(),
                });
                req.gen_error(e.result_code(), e.public_message().to_string())
            }
        }
    }

    async fn authenticate(
        &self,
        req: &SimpleBindRequest,
        context: &BindContext,
    ) -> Result<(), GatewayError> {
        let username = match username_from_dn(&req.dn, &self.base_dn) {
            Some(name) => name,
            None => {
                debug!("Bind DN {} is outside {}", req.dn, self.base_dn);
                return Err(GatewayError::InvalidCredentials);
            }
        };
        // Unauthenticated bind (RFC 4513 5.1.2)
        if req.pw.is_empty() {
            return Err(GatewayError::InvalidCredentials);
        }

        let credential = Credential::new(username.clone(), req.pw.clone());
        match self.auth.authenticate(&credential, context).await {
            Ok(true) => {}
            Ok(false) => return Err(GatewayError::InvalidCredentials),
            Err(e) => return Err(GatewayError::from_bind_failure(e)),
        }

        let Some(step_up) = &self.step_up else {
            return Ok(());
        };
        self.events.emit(GatewayEvent::NotificationRequest {
            username: username.clone(),
        });
        let outcome = step_up.request(&username).await;
        let label = match &outcome {
            Ok(o) => o.to_string(),
            Err(_) => "error".to_string(),
        };
        self.metrics.step_up_total.with_label_values(&[&label]).inc();
        self.events.emit(GatewayEvent::NotificationResponse {
            username: username.clone(),
            outcome: label,
        });

        match outcome {
            Ok(StepUpOutcome::Approve) => Ok(()),
            Ok(StepUpOutcome::Reject) => Err(GatewayError::InvalidCredentials),
            Ok(StepUpOutcome::Timeout) => Err(GatewayError::Unavailable(format!(
                "approval for {} timed out",
                username
            ))),
            Err(e @ StepUpError::Transport(_)) => Err(GatewayError::Unavailable(e.to_string())),
            Err(e) => Err(GatewayError::Operations(e.to_string())),
        }
    }

    /// Answer a search. Only a write failure towards the client is returned.
    pub async fn handle_search(
        &self,
        req: &SearchRequest,
        sink: &mut dyn ResponseSink,
    ) -> io::Result<()> {
        let started = Instant::now();
        let filter = Filter::from(&req.filter);

        if req.base.is_empty() && req.scope == LdapSearchScope::Base {
            let entry = self.root_dse().select(&req.attrs);
            self.events.emit(GatewayEvent::EntryFound {
                kind: EntryKind::RootDse,
                dn: String::new(),
            });
            sink.send_message(req.gen_result_entry(entry.into_search_entry()))
                .await?;
            return sink.send_message(req.gen_success()).await;
        }

        let guard = OperationGuard::new(self.metrics.clone(), "search");
        if !is_within_base(&req.base, &self.base_dn) {
            debug!("Search base {} is outside {}", req.base, self.base_dn);
            guard.finish_search("none", "no_such_object");
            let err = GatewayError::NoSuchObject(req.base.clone());
            return sink
                .send_message(req.gen_error(err.result_code(), err.public_message().to_string()))
                .await;
        }

        let intent = classify_filter(Some(&filter), &req.attrs);
        debug!("Search base={} filter={} intent={}", req.base, filter, intent);
        self.events.emit(GatewayEvent::SearchRequest {
            base: req.base.clone(),
            filter: filter.to_string(),
            intent: intent.to_string(),
        });

        let mut sent = 0usize;
        let outcome = self
            .dispatch(&intent, &filter, req, sink, &mut sent)
            .await;

        match outcome {
            Ok(()) => {
                guard.finish_search(intent.label(), "success");
            }
            Err(SearchFailure::Client(e)) => {
                guard.finish_search(intent.label(), "client_error");
                return Err(e);
            }
            Err(SearchFailure::Provider(e)) => {
                let err = GatewayError::from_search_failure(e);
                error!("Search for {} failed after {} entries: {}", filter, sent, err);
                self.events.emit(GatewayEvent::SearchError {
                    filter: filter.to_string(),
                    error: err.to_string(),
                });
                if sent == 0 {
                    guard.finish_search(intent.label(), "error");
                    return sink
                        .send_message(
                            req.gen_error(err.result_code(), err.public_message().to_string()),
                        )
                        .await;
                }
                guard.finish_search(intent.label(), "partial");
            }
        }

        self.events.emit(GatewayEvent::SearchResponse {
            entries: sent,
            duration: started.elapsed(),
        });
        sink.send_message(req.gen_success()).await
    }

    async fn dispatch(
        &self,
        intent: &RequestIntent,
        filter: &Filter,
        req: &SearchRequest,
        sink: &mut dyn ResponseSink,
        sent: &mut usize,
    ) -> Result<(), SearchFailure> {
        match intent {
            RequestIntent::SingleUser(name) => {
                if let Some(user) = self.directory.find_user(name).await? {
                    self.send_entry(EntryKind::User, project_user(&user, &self.base_dn), req, sink, sent)
                        .await?;
                }
                Ok(())
            }
            RequestIntent::AllUsers => self.send_all_users(req, sink, sent).await,
            RequestIntent::GroupSearch => self.send_groups(filter, req, sink, sent).await,
            RequestIntent::MixedSearch => {
                self.send_all_users(req, sink, sent).await?;
                self.send_groups(filter, req, sink, sent).await
            }
            RequestIntent::Unmatched => Ok(()),
        }
    }

    async fn send_all_users(
        &self,
        req: &SearchRequest,
        sink: &mut dyn ResponseSink,
        sent: &mut usize,
    ) -> Result<(), SearchFailure> {
        for user in self.directory.get_all_users().await? {
            self.send_entry(EntryKind::User, project_user(&user, &self.base_dn), req, sink, sent)
                .await?;
        }
        Ok(())
    }

    async fn send_groups(
        &self,
        filter: &Filter,
        req: &SearchRequest,
        sink: &mut dyn ResponseSink,
        sent: &mut usize,
    ) -> Result<(), SearchFailure> {
        let groups = if has_group_discriminator(filter) {
            self.directory.find_groups(&filter.to_string()).await?
        } else {
            self.directory.get_all_groups().await?
        };
        for group in groups {
            self.send_entry(EntryKind::Group, project_group(&group, &self.base_dn), req, sink, sent)
                .await?;
        }
        Ok(())
    }

    async fn send_entry(
        &self,
        kind: EntryKind,
        entry: ProtocolEntry,
        req: &SearchRequest,
        sink: &mut dyn ResponseSink,
        sent: &mut usize,
    ) -> Result<(), SearchFailure> {
        self.events.emit(GatewayEvent::EntryFound {
            kind,
            dn: entry.dn.clone(),
        });
        let msg = req.gen_result_entry(entry.select(&req.attrs).into_search_entry());
        sink.send_message(msg).await.map_err(SearchFailure::Client)?;
        *sent += 1;
        self.metrics
            .entries_sent_total
            .with_label_values(&[&kind.to_string()])
            .inc();
        Ok(())
    }

    fn root_dse(&self) -> ProtocolEntry {
        ProtocolEntry::new("")
            .with("objectClass", "top")
            .with("namingContexts", self.base_dn.as_str())
            .with("supportedLDAPVersion", "3")
            .with("vendorName", VENDOR_NAME)
    }
}

/// Lowercase a DN and drop the whitespace around separators.
fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("=")
                .to_ascii_lowercase()
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn is_within_base(dn: &str, base_dn: &str) -> bool {
    let dn = normalize_dn(dn);
    let base = normalize_dn(base_dn);
    dn == base || dn.ends_with(&format!(",{}", base))
}

/// Username from the first RDN of a DN located directly or indirectly
/// below the base DN.
fn username_from_dn(dn: &str, base_dn: &str) -> Option<String> {
    let normalized = normalize_dn(dn);
    let base = normalize_dn(base_dn);
    if !normalized.ends_with(&format!(",{}", base)) {
        return None;
    }
    let first = dn.split(',').next()?;
    let (_, value) = first.split_once('=')?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupRecord, UserRecord};
    use ldap3_proto::proto::LdapFilter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "dc=example,dc=com";

    struct StaticAuth;

    #[async_trait]
    impl AuthProvider for StaticAuth {
        async fn authenticate(
            &self,
            credential: &Credential,
            _context: &BindContext,
        ) -> Result<bool, ProviderError> {
            match (credential.username(), credential.password()) {
                ("ann", "secret") => Ok(true),
                ("down", _) => Err(ProviderError::Unavailable("refused".into())),
                _ => Ok(false),
            }
        }
    }

    #[derive(Default)]
    struct StaticDirectory {
        fail_groups: bool,
        group_lookups: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryProvider for StaticDirectory {
        async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, ProviderError> {
            Ok((username == "ann").then(|| UserRecord::new("ann", 10001, 10001)))
        }

        async fn get_all_users(&self) -> Result<Vec<UserRecord>, ProviderError> {
            Ok(vec![
                UserRecord::new("ann", 10001, 10001),
                UserRecord::new("bob", 10002, 10002),
            ])
        }

        async fn find_groups(&self, filter: &str) -> Result<Vec<GroupRecord>, ProviderError> {
            self.group_lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail_groups {
                return Err(ProviderError::Backend(format!("query {} failed", filter)));
            }
            Ok(vec![GroupRecord::new("ops", 5000).with_members(["ann"])])
        }

        async fn get_all_groups(&self) -> Result<Vec<GroupRecord>, ProviderError> {
            if self.fail_groups {
                return Err(ProviderError::Backend("groups table missing".into()));
            }
            Ok(vec![
                GroupRecord::new("ops", 5000).with_members(["ann"]),
                GroupRecord::new("dev", 5001),
            ])
        }
    }

    fn handler(directory: StaticDirectory) -> RequestHandler {
        RequestHandler::new(BASE, Arc::new(StaticAuth), Arc::new(directory))
    }

    fn bind(dn: &str, pw: &str) -> SimpleBindRequest {
        SimpleBindRequest {
            msgid: 1,
            dn: dn.to_string(),
            pw: pw.to_string(),
        }
    }

    fn search(base: &str, filter: LdapFilter, attrs: &[&str]) -> SearchRequest {
        SearchRequest {
            msgid: 2,
            base: base.to_string(),
            scope: LdapSearchScope::Subtree,
            filter,
            attrs: attrs.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn result_code(msg: &LdapMsg) -> LdapResultCode {
        match &msg.op {
            LdapOp::BindResponse(r) => r.res.code.clone(),
            LdapOp::SearchResultDone(r) => r.code.clone(),
            other => panic!("not a result: {:?}", other),
        }
    }

    fn entry_dns(msgs: &[LdapMsg]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match &m.op {
                LdapOp::SearchResultEntry(e) => Some(e.dn.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_username_from_dn() {
        assert_eq!(
            username_from_dn("uid=ann,dc=example,dc=com", BASE),
            Some("ann".to_string())
        );
        assert_eq!(
            username_from_dn("cn=Ann, ou=people, DC=Example, DC=com", BASE),
            Some("Ann".to_string())
        );
        assert_eq!(username_from_dn("uid=ann,dc=other,dc=com", BASE), None);
        assert_eq!(username_from_dn(BASE, BASE), None);
        assert_eq!(username_from_dn("uid=,dc=example,dc=com", BASE), None);
    }

    #[test]
    fn test_is_within_base() {
        assert!(is_within_base(BASE, BASE));
        assert!(is_within_base("ou=groups,dc=example,dc=com", BASE));
        assert!(!is_within_base("dc=com", BASE));
        assert!(!is_within_base("dc=notexample,dc=com", BASE));
    }

    #[tokio::test]
    async fn test_bind_outcomes() {
        let h = handler(StaticDirectory::default());
        let ctx = BindContext::new("");

        let ok = h.handle_bind(&bind("uid=ann,dc=example,dc=com", "secret"), &ctx).await;
        assert_eq!(result_code(&ok), LdapResultCode::Success);

        let wrong = h.handle_bind(&bind("uid=ann,dc=example,dc=com", "nope"), &ctx).await;
        assert_eq!(result_code(&wrong), LdapResultCode::InvalidCredentials);

        let empty_pw = h.handle_bind(&bind("uid=ann,dc=example,dc=com", ""), &ctx).await;
        assert_eq!(result_code(&empty_pw), LdapResultCode::InvalidCredentials);

        let outside = h.handle_bind(&bind("uid=ann,dc=evil,dc=com", "secret"), &ctx).await;
        assert_eq!(result_code(&outside), LdapResultCode::InvalidCredentials);

        let down = h.handle_bind(&bind("uid=down,dc=example,dc=com", "x"), &ctx).await;
        assert_eq!(result_code(&down), LdapResultCode::Unavailable);

        let anonymous = h.handle_bind(&bind("", ""), &ctx).await;
        assert_eq!(result_code(&anonymous), LdapResultCode::Success);
    }

    #[tokio::test]
    async fn test_single_user_search() {
        let h = handler(StaticDirectory::default());
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Equality("uid".into(), "ann".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();

        assert_eq!(entry_dns(&out), vec!["uid=ann,dc=example,dc=com"]);
        assert_eq!(result_code(out.last().unwrap()), LdapResultCode::Success);

        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Equality("uid".into(), "ghost".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(result_code(&out[0]), LdapResultCode::Success);
    }

    #[tokio::test]
    async fn test_mixed_search_orders_users_first() {
        let h = handler(StaticDirectory::default());
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Present("objectClass".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();

        assert_eq!(
            entry_dns(&out),
            vec![
                "uid=ann,dc=example,dc=com",
                "uid=bob,dc=example,dc=com",
                "cn=ops,dc=example,dc=com",
                "cn=dev,dc=example,dc=com",
            ]
        );
    }

    #[tokio::test]
    async fn test_group_search_uses_discriminator() {
        let directory = Arc::new(StaticDirectory::default());
        let h = RequestHandler::new(BASE, Arc::new(StaticAuth), directory.clone());

        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Equality("objectClass".into(), "posixGroup".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(entry_dns(&out).len(), 2);
        assert_eq!(directory.group_lookups.load(Ordering::SeqCst), 0);

        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(
            BASE,
            LdapFilter::And(vec![
                LdapFilter::Equality("objectClass".into(), "posixGroup".into()),
                LdapFilter::Equality("memberUid".into(), "ann".into()),
            ]),
            &[],
        );
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(entry_dns(&out), vec!["cn=ops,dc=example,dc=com"]);
        assert_eq!(directory.group_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_before_entries_is_error() {
        let h = handler(StaticDirectory {
            fail_groups: true,
            ..Default::default()
        });
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Equality("objectClass".into(), "posixGroup".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(result_code(&out[0]), LdapResultCode::OperationsError);
    }

    #[tokio::test]
    async fn test_provider_failure_after_entries_keeps_partial_result() {
        let h = handler(StaticDirectory {
            fail_groups: true,
            ..Default::default()
        });
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Present("objectClass".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(entry_dns(&out).len(), 2);
        assert_eq!(result_code(out.last().unwrap()), LdapResultCode::Success);
    }

    #[tokio::test]
    async fn test_search_outside_base() {
        let h = handler(StaticDirectory::default());
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search("dc=other,dc=org", LdapFilter::Present("objectClass".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();
        assert_eq!(result_code(&out[0]), LdapResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_root_dse() {
        let h = handler(StaticDirectory::default());
        let mut out: Vec<LdapMsg> = Vec::new();
        let mut req = search("", LdapFilter::Present("objectClass".into()), &[]);
        req.scope = LdapSearchScope::Base;
        h.handle_search(&req, &mut out).await.unwrap();

        assert_eq!(out.len(), 2);
        match &out[0].op {
            LdapOp::SearchResultEntry(e) => {
                let naming = e
                    .attributes
                    .iter()
                    .find(|a| a.atype == "namingContexts")
                    .unwrap();
                assert_eq!(naming.vals, vec![BASE.as_bytes().to_vec()]);
            }
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_events() {
        let h = handler(StaticDirectory::default());
        let mut events = h.subscribe();
        let mut out: Vec<LdapMsg> = Vec::new();
        let req = search(BASE, LdapFilter::Equality("uid".into(), "ann".into()), &[]);
        h.handle_search(&req, &mut out).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), GatewayEvent::SearchRequest { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            GatewayEvent::EntryFound { kind: EntryKind::User, .. }
        ));
        match events.recv().await.unwrap() {
            GatewayEvent::SearchResponse { entries, .. } => assert_eq!(entries, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    enum Approval {
        Slow,
        Unreachable,
        Garbled,
    }

    #[async_trait]
    impl crate::stepup::ApprovalTransport for Approval {
        async fn request_approval(
            &self,
            _username: &str,
        ) -> Result<crate::stepup::ApprovalDecision, StepUpError> {
            match self {
                Approval::Slow => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(crate::stepup::ApprovalDecision::Approve)
                }
                Approval::Unreachable => Err(StepUpError::Transport("connection refused".into())),
                Approval::Garbled => Err(StepUpError::InvalidResponse("unknown action 'maybe'".into())),
            }
        }
    }

    async fn bind_with_approval(approval: Approval) -> LdapResultCode {
        let notifier = StepUpNotifier::new(Arc::new(approval)).with_deadline(Duration::from_secs(25));
        let h = handler(StaticDirectory::default()).with_step_up(notifier);
        let response = h
            .handle_bind(&bind("uid=ann,dc=example,dc=com", "secret"), &BindContext::new(""))
            .await;
        result_code(&response)
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_up_timeout_is_unavailable() {
        let started = tokio::time::Instant::now();
        assert_eq!(bind_with_approval(Approval::Slow).await, LdapResultCode::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_up_transport_failure_is_unavailable() {
        assert_eq!(
            bind_with_approval(Approval::Unreachable).await,
            LdapResultCode::Unavailable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_up_bad_answer_is_operations_error() {
        assert_eq!(
            bind_with_approval(Approval::Garbled).await,
            LdapResultCode::OperationsError
        );
    }
}
