//! Route selector: longest-prefix match over an application's destinations,
//! round-robin among the online survivors

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::registry::{Application, Destination};

/// Pick the backend destination for a request path. Returns `None` when no
/// matching destination is online.
pub fn select_backend_route(app: &Application, path: &str) -> Option<Arc<Destination>> {
    let best_len = app
        .destinations
        .iter()
        .filter(|dest| path.starts_with(dest.request_route.as_str()))
        .map(|dest| dest.request_route.len())
        .max()?;

    let candidates: Vec<&Arc<Destination>> = app
        .destinations
        .iter()
        .filter(|dest| {
            dest.request_route.len() == best_len
                && path.starts_with(dest.request_route.as_str())
                && dest.is_online()
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }

    let idx = app.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
    Some(candidates[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        ApplicationDoc, BackendDoc, ClientIpMethod, DomainDoc, MemoryStore, Registry, RouteType,
    };
    use std::sync::Arc as StdArc;

    fn app_with_destinations(routes: Vec<(&str, &str)>) -> StdArc<Application> {
        let store = StdArc::new(MemoryStore::default());
        store.set_backend(BackendDoc {
            applications: vec![ApplicationDoc {
                id: 1,
                name: "test".to_string(),
                internal_scheme: "http".to_string(),
                client_ip_method: ClientIpMethod::RemoteAddr,
                redirect_https: false,
                waf_enabled: false,
                shield_enabled: false,
                oauth_required: false,
                session_seconds: 3600,
                owner: String::new(),
                destinations: routes
                    .iter()
                    .enumerate()
                    .map(|(i, (request_route, destination))| {
                        crate::registry::DestinationDoc {
                            id: i as i64 + 1,
                            route_type: RouteType::HttpProxy,
                            request_route: request_route.to_string(),
                            backend_route: "/".to_string(),
                            destination: destination.to_string(),
                        }
                    })
                    .collect(),
            }],
            domains: vec![DomainDoc {
                id: 1,
                name: "t.example.com".to_string(),
                app_id: 1,
                cert_id: 0,
                redirect: false,
                location: String::new(),
            }],
            certs: vec![],
        });
        let registry = Registry::new(store);
        registry.reload_backend().unwrap();
        registry.app_by_id(1).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let app = app_with_destinations(vec![
            ("/", "fallback:80"),
            ("/api/", "api:8080"),
        ]);

        let dest = select_backend_route(&app, "/api/users").unwrap();
        assert_eq!(dest.destination, "api:8080");

        let dest = select_backend_route(&app, "/index.css").unwrap();
        assert_eq!(dest.destination, "fallback:80");
    }

    #[test]
    fn test_round_robin_rotates() {
        let app = app_with_destinations(vec![("/", "a:80"), ("/", "b:80")]);

        let first = select_backend_route(&app, "/").unwrap().destination.clone();
        let second = select_backend_route(&app, "/").unwrap().destination.clone();
        let third = select_backend_route(&app, "/").unwrap().destination.clone();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_offline_destination_skipped() {
        let app = app_with_destinations(vec![("/", "a:80"), ("/", "b:80")]);
        app.destinations[0].mark_offline(0);

        for _ in 0..4 {
            let dest = select_backend_route(&app, "/").unwrap();
            assert_eq!(dest.destination, "b:80");
        }
    }

    #[test]
    fn test_all_offline_returns_none() {
        let app = app_with_destinations(vec![("/", "a:80")]);
        app.destinations[0].mark_offline(0);
        assert!(select_backend_route(&app, "/").is_none());
    }

    #[test]
    fn test_no_matching_prefix() {
        let app = app_with_destinations(vec![("/api/", "api:8080")]);
        assert!(select_backend_route(&app, "/other").is_none());
    }
}
