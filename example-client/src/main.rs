use std::sync::atomic::AtomicUsize;

use msgpack_rpc::{client, params, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    static I: AtomicUsize = AtomicUsize::new(0);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name_fn(|| {
            format!(
                "app-{}",
                I.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            )
        })
        .worker_threads(2)
        .enable_all()
        .build()?;

    runtime.block_on(run_main())
}

async fn run_main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let address = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1:6666".to_string());

    let mut configuration = client::Configuration::default();
    configuration.call_timeout(Some(std::time::Duration::from_secs(5)));
    let session = client::connect(&address, &configuration).await?;
    session.on_notification(|method: String, params: Vec<Value>| {
        log::info!("notification {method}: {params:?}");
    });

    match session.call("vim_list_runtime_paths", params![]).await {
        Ok(Value::Array(paths)) => {
            for path in paths {
                log::info!("runtime path: {path}");
            }
        }
        Ok(other) => log::warn!("unexpected result: {other}"),
        Err(msgpack_rpc::Error::Remote(error)) => log::error!("server returned an error: {error}"),
        Err(e) => {
            session.close().await;
            return Err(e.into());
        }
    }

    session.close().await;
    Ok(())
}
