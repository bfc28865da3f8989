#![allow(dead_code)]

use rippledb_core::{Engine, EngineConfig};
use rippledb_protocol::ReplicaId;
use rippledb_server::{AccessControl, Grants, RequestHandler, Server, ServerConfig};
use rippledb_wal::WalConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn open_engine(path: &Path, instance_id: ReplicaId) -> Arc<Engine> {
    Arc::new(
        Engine::open(EngineConfig {
            instance_id,
            wal: WalConfig::new(path),
        })
        .unwrap(),
    )
}

/// A server running in the background.
pub struct Running {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.server.shutdown();
        self.task.await.unwrap();
    }
}

pub async fn serve_on(listener: TcpListener, handler: RequestHandler) -> Running {
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(addr), Arc::new(handler)));
    let task = {
        let server = server.clone();
        tokio::spawn(async move {
            server.run_with_listener(listener).await.unwrap();
        })
    };
    Running { server, addr, task }
}

pub async fn serve(engine: Arc<Engine>) -> Running {
    serve_with(engine, Arc::new(Grants::allow_all())).await
}

pub async fn serve_with(engine: Arc<Engine>, access: Arc<dyn AccessControl>) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_on(listener, RequestHandler::new(engine, access)).await
}

/// An address nothing listens on yet.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
