use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use propwatch::coordination::memory::MemoryCoordinator;
use propwatch::{
    ClientFactory, ClientRegistry, CoordinationClient, ManagerSettings, PropertiesManager,
    Result,
};
use tokio_test::block_on;

#[derive(Default)]
struct SharedNodeFactory {
    connects: AtomicUsize,
    node: Arc<MemoryCoordinator>,
}

#[async_trait]
impl ClientFactory for SharedNodeFactory {
    async fn connect(&self, _connection_string: &str) -> Result<Arc<dyn CoordinationClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.node.clone())
    }
}

#[test]
fn managers_share_one_connection_per_string() {
    let factory = Arc::new(SharedNodeFactory::default());
    factory.node.set("/svc/a", "name=a\n");
    factory.node.set("/svc/b", "name=b\n");
    let registry = Arc::new(ClientRegistry::new());

    block_on(async {
        let mut managers = Vec::new();
        for path in ["/svc/a", "/svc/b"] {
            let manager = PropertiesManager::builder()
                .with_location(format!("zookeeper:{path}"))
                .with_connection_string("zk1:2181")
                .with_client_factory(factory.clone())
                .with_client_registry(registry.clone())
                .build()
                .await
                .unwrap();
            managers.push(manager);
        }

        assert_eq!(managers[0].get("name").as_deref(), Some("a"));
        assert_eq!(managers[1].get("name").as_deref(), Some("b"));
    });

    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn settings_drive_the_builder() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.properties"), "greeting=hi ${who}\nwho=there\n").unwrap();

    let settings = ManagerSettings {
        locations: vec!["classpath:app.properties".to_string()],
        resource_root: dir.path().to_path_buf(),
        ..ManagerSettings::default()
    };

    let manager = block_on(PropertiesManager::builder().with_settings(settings).build()).unwrap();
    assert_eq!(
        manager.resolve_property("greeting").unwrap().as_deref(),
        Some("hi there")
    );
}
