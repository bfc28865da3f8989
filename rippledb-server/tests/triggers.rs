mod common;

use common::{open_engine, serve_with, WAIT};
use parking_lot::Mutex;
use rippledb_protocol::{ErrorCode, FrameReader, FrameWriter, Reply, Request, RequestType};
use rippledb_server::{Action, Grants, HookError, SessionEvent, TokenValidator};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

async fn connect(addr: SocketAddr) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut reader = FrameReader::new(r);
    reader.read_greeting().await.unwrap();
    (reader, FrameWriter::new(w))
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_and_disconnect_hooks() {
    let dir = TempDir::new().unwrap();
    let running = serve_with(open_engine(dir.path(), 1), Arc::new(Grants::allow_all())).await;
    let triggers = running.server.handler().triggers().clone();

    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    {
        let connects = connects.clone();
        triggers.register(SessionEvent::Connect, move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let disconnects = disconnects.clone();
        triggers.register(SessionEvent::Disconnect, move |info| {
            disconnects.lock().push(info.session_id);
            Ok(())
        });
    }

    let (mut reader, mut writer) = connect(running.addr).await;
    writer.send(&Request::Ping.to_message(1)).await.unwrap();
    reader.read_message().await.unwrap().unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(disconnects.lock().is_empty());

    drop(writer);
    drop(reader);
    wait_until(|| disconnects.lock().len() == 1).await;

    running.stop().await;
}

#[tokio::test]
async fn test_failing_connect_hook_drops_connection() {
    let dir = TempDir::new().unwrap();
    let running = serve_with(open_engine(dir.path(), 1), Arc::new(Grants::allow_all())).await;
    let triggers = running.server.handler().triggers().clone();

    let second_ran = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    triggers.register(SessionEvent::Connect, |_| Err(HookError::new("maintenance")));
    {
        let second_ran = second_ran.clone();
        triggers.register(SessionEvent::Connect, move |_| {
            second_ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let disconnects = disconnects.clone();
        triggers.register(SessionEvent::Disconnect, move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let (mut reader, mut writer) = connect(running.addr).await;
    let _ = writer.send(&Request::Ping.to_message(1)).await;
    let next = tokio::time::timeout(WAIT, reader.read_frame()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));

    assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_auth_hook_sees_user() {
    let dir = TempDir::new().unwrap();
    let mut grants = Grants::default();
    grants.add_user(
        "replicator",
        TokenValidator::hash_token("s3cret"),
        [Action::Read, Action::Replication],
    );
    let running = serve_with(open_engine(dir.path(), 1), Arc::new(grants)).await;

    let users = Arc::new(Mutex::new(Vec::new()));
    {
        let users = users.clone();
        running
            .server
            .handler()
            .triggers()
            .register(SessionEvent::Auth, move |info| {
                users.lock().push(info.user.clone());
                Ok(())
            });
    }

    let (mut reader, mut writer) = connect(running.addr).await;

    let bad = Request::Auth {
        user: "replicator".to_string(),
        token: "wrong".to_string(),
    };
    writer.send(&bad.to_message(1)).await.unwrap();
    let reply = reader.read_message().await.unwrap().unwrap();
    let failure = Reply::classify(reply).unwrap().into_result().unwrap_err();
    assert_eq!(failure.error_code(), Some(ErrorCode::PasswordMismatch));
    assert!(users.lock().is_empty());

    let good = Request::Auth {
        user: "replicator".to_string(),
        token: "s3cret".to_string(),
    };
    writer.send(&good.to_message(2)).await.unwrap();
    let reply = reader.read_message().await.unwrap().unwrap();
    assert_eq!(reply.code().unwrap(), RequestType::Ok.as_u32());
    assert_eq!(reply.sync(), 2);
    assert_eq!(users.lock().as_slice(), ["replicator".to_string()]);

    running.stop().await;
}
