//! Runs two in-process agents against simulated devices and drives them
//! through the client dispatcher.
//!
//! ```text
//! RUST_LOG=debug cargo run --example local_agent
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use notch::agent::Agent;
use notch::client::{Client, ClientOptions, LoadBalancePolicy, LocalTransport};
use notch::config::AgentConfig;
use notch::credential::CredentialStore;
use notch::driver::memory::MemoryDriverFactory;
use notch::rpc::{RpcReply, RpcRequest};

const CONFIG: &str = r#"
options:
  session_maint_period: 1
devices:
  - name: ar1.mel
    device_type: cisco
    addresses: [192.0.2.1]
  - name: cr1.syd
    device_type: juniper
    addresses: [192.0.2.10, 192.0.2.11]
device_types:
  cisco:
    idle_timeout: 2
"#;

const CREDENTIALS: &str = r#"
- regexp: .*
  username: netops
  password: change-me
"#;

fn build_agent(label: &str) -> anyhow::Result<(Arc<Agent>, Arc<MemoryDriverFactory>)> {
    let factory = Arc::new(MemoryDriverFactory::new());
    for device in ["ar1.mel", "cr1.syd"] {
        let sim = factory.device(device);
        sim.respond("show version", format!("{device} served by {label}\n"));
        sim.put("running-config", format!("hostname {device}\n"));
        sim.set_latency(Duration::from_millis(25));
    }
    let agent = Agent::builder(AgentConfig::from_yaml_str(CONFIG)?)
        .credentials(CredentialStore::from_yaml_str(CREDENTIALS)?)
        .driver_factory(factory.clone())
        .build()
        .with_context(|| format!("building agent {label}"))?;
    agent.start_maintenance();
    Ok((Arc::new(agent), factory))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let (east, _) = build_agent("east")?;
    let (west, west_devices) = build_agent("west")?;
    let transport = LocalTransport::new()
        .with_json_encoding(true)
        .with_agent("east", east.clone())
        .with_agent("west", west.clone());
    let client = Client::with_options(
        Arc::new(transport),
        vec!["east".to_string(), "west".to_string()],
        ClientOptions {
            policy: LoadBalancePolicy::RoundRobin,
            ..ClientOptions::default()
        },
    );

    let names = match client.devices_matching(".*").wait().await? {
        RpcReply::DeviceNames(names) => names,
        other => anyhow::bail!("unexpected reply {other:?}"),
    };
    println!("devices: {names:?}");

    for device in &names {
        client.submit_with_callback(
            RpcRequest::Command {
                device_name: device.clone(),
                command: "show version".to_string(),
                mode: None,
            },
            |completion| match completion.payload() {
                Ok(output) => print!(
                    "[{}] {}",
                    completion.agent.as_deref().unwrap_or("-"),
                    String::from_utf8_lossy(&output)
                ),
                Err(e) => println!("{:?} failed: {e}", completion.device_name),
            },
        );
    }
    client.wait_all().await;

    client
        .set_config("cr1.syd", "candidate.conf", b"set system host-name cr1\n", None)
        .wait()
        .await?;
    println!("stored on west: {:?}", west_devices.device("cr1.syd").file("candidate.conf").is_some());

    for stats in client.backend_stats() {
        println!(
            "{}: requests={} errors={} last_rtt={:?}",
            stats.agent, stats.requests, stats.errors, stats.last_rtt
        );
    }

    tokio::time::sleep(Duration::from_secs(4)).await;
    println!("east sessions after idle sweep: {:?}", east.sessions().snapshot());

    east.shutdown().await;
    west.shutdown().await;
    Ok(())
}
