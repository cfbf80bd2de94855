use std::sync::Arc;

use taskd::config::{SERVICE_NAME, SERVICE_PATH};
use taskd::ipc::{Service, ZbusFollowerTransport, ZbusNotifier};
use taskd::TaskManager;
use tokio::sync::Notify;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();

    let connection = runtime.block_on(zbus::Connection::session())?;

    let transport = Arc::new(ZbusFollowerTransport::new(connection.clone(), handle.clone()));
    let notifier = Arc::new(ZbusNotifier::new(connection.clone(), handle.clone()));
    let manager = TaskManager::new(transport, notifier);

    let shutdown = Arc::new(Notify::new());
    let service = Service::new(manager.clone(), shutdown.clone());

    runtime.block_on(async {
        connection.object_server().at(SERVICE_PATH, service).await?;
        connection.request_name(SERVICE_NAME).await?;
        anyhow::Ok(())
    })?;

    println!("Service running...");
    runtime.block_on(shutdown.notified());
    println!("Service stopped");

    Ok(())
}
