use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use warp::Filter;

use crate::presence::{AttendanceServer, Snapshot};

/// Body of `GET /attendance/roster`
#[derive(Debug, Serialize)]
struct RosterView {
    present: Vec<String>,
    active: Vec<String>,
    students_online: Vec<String>,
    teachers_online: Vec<String>,
}

impl From<Snapshot> for RosterView {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            present: snapshot.present,
            active: snapshot.active_timers,
            students_online: snapshot.students_online,
            teachers_online: snapshot.teachers_online,
        }
    }
}

/// Read-only HTTP status routes
pub fn attendance_routes(
    server: Arc<AttendanceServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    attendance_health_check()
        .or(attendance_roster(server.clone()))
        .or(attendance_log(server))
}

pub fn attendance_health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("attendance" / "health")
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Attendance Server",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

/// Online lists, running timers and present students
pub fn attendance_roster(
    server: Arc<AttendanceServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("attendance" / "roster")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|server: Arc<AttendanceServer>| async move {
            let view = RosterView::from(server.snapshot().await);
            Ok::<_, Infallible>(warp::reply::json(&view))
        })
}

pub fn attendance_log(
    server: Arc<AttendanceServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("attendance" / "log")
        .and(warp::get())
        .and(with_server(server))
        .and_then(|server: Arc<AttendanceServer>| async move {
            Ok::<_, Infallible>(warp::reply::json(&server.attendance_log().await))
        })
}

fn with_server(
    server: Arc<AttendanceServer>,
) -> impl Filter<Extract = (Arc<AttendanceServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::presence::{Identity, PersistentStore};
    use chrono::Utc;

    async fn server(dir: &tempfile::TempDir) -> Arc<AttendanceServer> {
        let store = PersistentStore::new(dir.path().join("data.json"), dir.path().join("log.json"));
        AttendanceServer::start(store, SessionConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = warp::test::request()
            .method("GET")
            .path("/attendance/health")
            .reply(&attendance_health_check())
            .await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "Attendance Server");
    }

    #[tokio::test]
    async fn test_roster_reflects_state() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let id = server.next_connection_id();
        let channel = crate::presence::ChannelHandle::new(
            id,
            tx,
            Arc::new(tokio::sync::Notify::new()),
        );
        let alice = Identity::student("alice");
        server.login(alice.clone(), channel).await.unwrap();
        server.start_timer(&alice, id, "alice").await.unwrap();

        let resp = warp::test::request()
            .method("GET")
            .path("/attendance/roster")
            .reply(&attendance_routes(server))
            .await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["students_online"], serde_json::json!(["alice"]));
        assert_eq!(body["teachers_online"], serde_json::json!([]));
        assert_eq!(body["active"], serde_json::json!(["alice"]));
        assert_eq!(body["present"], serde_json::json!([]));
        assert!(body.get("active_timers").is_none());
    }

    #[tokio::test]
    async fn test_log_route() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir).await;
        server.store().append_log("bob", Utc::now()).await.unwrap();

        let resp = warp::test::request()
            .method("GET")
            .path("/attendance/log")
            .reply(&attendance_routes(server))
            .await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert!(body["bob"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resp = warp::test::request()
            .method("GET")
            .path("/attendance/nope")
            .reply(&attendance_routes(server(&dir).await))
            .await;
        assert_eq!(resp.status(), 404);
    }
}
