//! Gateway-facing handles for proxied resources.
//!
//! A [`TunnelDependency`] owns exactly one established [`Tunnel`] and comes
//! in two variants: a generic HTTP/WebSocket target, or a remote-desktop
//! session. Dedup identity is not the numeric id but a kind-specific
//! [`IdentityKey`] — the resolved base URL for HTTP targets, the
//! `(protocol, host, port)` triple for desktops.

use std::sync::{Arc, Mutex, Weak};

use crate::session::set::SessionTunnelSet;
use crate::ssh::Tunnel;

/// Kind-specific attribute tuple used for dedup, distinct from the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Http {
        scheme: &'static str,
        host: String,
        port: u16,
        root: String,
    },
    Desktop {
        protocol: String,
        host: String,
        port: u16,
    },
}

/// Generic HTTP/WebSocket target behind a forward.
#[derive(Debug)]
pub struct HttpTarget {
    /// Resolved root path on the target (template placeholders substituted).
    pub root: String,
    /// Target speaks https/wss on its loopback port.
    pub secure: bool,
    /// Legacy mode: rewrite root-relative links in HTML responses.
    pub rewrite_html: bool,
    /// Logical target host (gateway-normalized), for dedup and listing.
    pub remote_host: String,
    pub remote_port: u16,
}

/// Remote-desktop session metadata, updatable on a dedup hit without
/// reopening the forward.
#[derive(Debug, Clone)]
pub struct DesktopMeta {
    pub display_name: String,
    pub password: String,
}

/// Remote-desktop target behind a forward.
#[derive(Debug)]
pub struct DesktopTarget {
    pub protocol: String,
    /// Logical target host (gateway-normalized), for dedup and listing.
    pub remote_host: String,
    pub remote_port: u16,
    meta: Mutex<DesktopMeta>,
}

/// Closed set of proxied-resource variants.
#[derive(Debug)]
pub enum DependencyKind {
    Http(HttpTarget),
    Desktop(DesktopTarget),
}

/// A proxied resource bound to one established tunnel.
pub struct TunnelDependency {
    id: u64,
    kind: DependencyKind,
    tunnel: Tunnel,
    /// The set this dependency currently lives in; updated when a session
    /// merge migrates ownership.
    owner: Mutex<Weak<SessionTunnelSet>>,
}

/// Substitute the `_id_` placeholder in a root path template with the
/// dependency's numeric id.
pub fn resolve_root(template: &str, id: u64) -> String {
    template.replace("_id_", &id.to_string())
}

impl TunnelDependency {
    pub fn http(
        id: u64,
        root: String,
        secure: bool,
        rewrite_html: bool,
        remote_host: String,
        remote_port: u16,
        tunnel: Tunnel,
    ) -> Self {
        Self {
            id,
            kind: DependencyKind::Http(HttpTarget {
                root,
                secure,
                rewrite_html,
                remote_host,
                remote_port,
            }),
            tunnel,
            owner: Mutex::new(Weak::new()),
        }
    }

    pub fn desktop(
        id: u64,
        display_name: String,
        password: String,
        protocol: String,
        remote_host: String,
        remote_port: u16,
        tunnel: Tunnel,
    ) -> Self {
        Self {
            id,
            kind: DependencyKind::Desktop(DesktopTarget {
                protocol,
                remote_host,
                remote_port,
                meta: Mutex::new(DesktopMeta {
                    display_name,
                    password,
                }),
            }),
            tunnel,
            owner: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &DependencyKind {
        &self.kind
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn local_port(&self) -> u16 {
        self.tunnel.local_port()
    }

    pub fn is_http(&self) -> bool {
        matches!(self.kind, DependencyKind::Http(_))
    }

    pub fn is_desktop(&self) -> bool {
        matches!(self.kind, DependencyKind::Desktop(_))
    }

    pub fn identity_key(&self) -> IdentityKey {
        match &self.kind {
            DependencyKind::Http(t) => IdentityKey::Http {
                scheme: if t.secure { "https" } else { "http" },
                host: t.remote_host.clone(),
                port: t.remote_port,
                root: t.root.clone(),
            },
            DependencyKind::Desktop(t) => IdentityKey::Desktop {
                protocol: t.protocol.clone(),
                host: t.remote_host.clone(),
                port: t.remote_port,
            },
        }
    }

    /// Desktop metadata snapshot; `None` for HTTP targets.
    pub fn desktop_meta(&self) -> Option<DesktopMeta> {
        match &self.kind {
            DependencyKind::Desktop(t) => {
                Some(t.meta.lock().expect("desktop meta poisoned").clone())
            }
            DependencyKind::Http(_) => None,
        }
    }

    /// Rename/re-key a desktop session in place (dedup-hit path).
    pub fn update_desktop_meta(&self, display_name: String, password: String) {
        if let DependencyKind::Desktop(t) = &self.kind {
            let mut meta = t.meta.lock().expect("desktop meta poisoned");
            meta.display_name = display_name;
            meta.password = password;
        }
    }

    /// Build the outbound URL for a relayed exchange: the loopback base with
    /// exactly one `/` between root and path, regardless of leading/trailing
    /// slashes on either. HTTP targets only.
    pub fn target_url(&self, ws: bool, path: &str, query: Option<&str>) -> Option<String> {
        let DependencyKind::Http(t) = &self.kind else {
            return None;
        };
        let scheme = match (ws, t.secure) {
            (false, false) => "http",
            (false, true) => "https",
            (true, false) => "ws",
            (true, true) => "wss",
        };
        let root = t.root.trim_matches('/');
        let path = path.trim_start_matches('/');

        let mut url = format!("{scheme}://localhost:{}/", self.tunnel.local_port());
        if !root.is_empty() {
            url.push_str(root);
            url.push('/');
        }
        url.push_str(path);
        if let Some(q) = query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }
        Some(url)
    }

    pub(crate) fn set_owner(&self, set: &Arc<SessionTunnelSet>) {
        *self.owner.lock().expect("owner lock poisoned") = Arc::downgrade(set);
    }

    /// Remove this dependency from the set that currently holds it, if any.
    pub(crate) fn detach_owner(&self) {
        let owner = self
            .owner
            .lock()
            .expect("owner lock poisoned")
            .upgrade();
        if let Some(set) = owner {
            set.remove(self.id);
        }
    }
}

impl std::fmt::Debug for TunnelDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDependency")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local_port", &self.tunnel.local_port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    fn tunnel(local_port: u16) -> Tunnel {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, _rx) = oneshot::channel();
        Tunnel::handle(local_port, "vis01".to_string(), 8888, running, tx)
    }

    fn http_dep(root: &str, secure: bool) -> TunnelDependency {
        TunnelDependency::http(
            7,
            root.to_string(),
            secure,
            false,
            "vis01".to_string(),
            8888,
            tunnel(9100),
        )
    }

    #[test]
    fn test_resolve_root_substitutes_id() {
        assert_eq!(resolve_root("proxy/_id_/app", 42), "proxy/42/app");
        assert_eq!(resolve_root("plain", 42), "plain");
    }

    #[test]
    fn test_target_url_single_separator() {
        let dep = http_dep("base", false);
        assert_eq!(
            dep.target_url(false, "foo", None).unwrap(),
            "http://localhost:9100/base/foo"
        );
        // Slash soup on both sides collapses to exactly one separator.
        let dep = http_dep("/base/", false);
        assert_eq!(
            dep.target_url(false, "/foo", None).unwrap(),
            "http://localhost:9100/base/foo"
        );
    }

    #[test]
    fn test_target_url_empty_root_and_path() {
        let dep = http_dep("", false);
        assert_eq!(
            dep.target_url(false, "foo", None).unwrap(),
            "http://localhost:9100/foo"
        );
        assert_eq!(
            dep.target_url(false, "", None).unwrap(),
            "http://localhost:9100/"
        );
    }

    #[test]
    fn test_target_url_schemes_mirror_secure_flag() {
        let dep = http_dep("base", true);
        assert!(dep
            .target_url(false, "x", None)
            .unwrap()
            .starts_with("https://"));
        assert!(dep.target_url(true, "x", None).unwrap().starts_with("wss://"));
        let dep = http_dep("base", false);
        assert!(dep.target_url(true, "x", None).unwrap().starts_with("ws://"));
    }

    #[test]
    fn test_target_url_appends_query() {
        let dep = http_dep("base", false);
        assert_eq!(
            dep.target_url(false, "foo", Some("x=1&y=2")).unwrap(),
            "http://localhost:9100/base/foo?x=1&y=2"
        );
        assert_eq!(
            dep.target_url(false, "foo", Some("")).unwrap(),
            "http://localhost:9100/base/foo"
        );
    }

    #[test]
    fn test_desktop_has_no_target_url() {
        let dep = TunnelDependency::desktop(
            1,
            "Desktop".to_string(),
            "pw".to_string(),
            "vnc".to_string(),
            "vis01".to_string(),
            5901,
            tunnel(9101),
        );
        assert!(dep.target_url(false, "foo", None).is_none());
    }

    #[test]
    fn test_identity_key_ignores_name_and_password() {
        let a = TunnelDependency::desktop(
            1,
            "A".to_string(),
            "P1".to_string(),
            "vnc".to_string(),
            "vis01".to_string(),
            5901,
            tunnel(9102),
        );
        let b = TunnelDependency::desktop(
            2,
            "B".to_string(),
            "P2".to_string(),
            "vnc".to_string(),
            "vis01".to_string(),
            5901,
            tunnel(9103),
        );
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_identity_key_http_differs_by_root_and_scheme() {
        let a = http_dep("base", false);
        let b = http_dep("other", false);
        let c = http_dep("base", true);
        assert_ne!(a.identity_key(), b.identity_key());
        assert_ne!(a.identity_key(), c.identity_key());
        assert_eq!(a.identity_key(), http_dep("base", false).identity_key());
    }

    #[test]
    fn test_update_desktop_meta_in_place() {
        let dep = TunnelDependency::desktop(
            1,
            "A".to_string(),
            "P1".to_string(),
            "vnc".to_string(),
            "vis01".to_string(),
            5901,
            tunnel(9104),
        );
        dep.update_desktop_meta("B".to_string(), "P2".to_string());
        let meta = dep.desktop_meta().unwrap();
        assert_eq!(meta.display_name, "B");
        assert_eq!(meta.password, "P2");
    }
}
