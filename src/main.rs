use sipua::application::{Engine, EngineRuntime};
use sipua::config::EngineConfig;
use sipua::infrastructure::protocols::sip::{
    Credential, EngineEvent, Indication, RegistrationOptions, ResponseOptions, StaticOfferAnswer,
    UdpTransport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Usage: `sipua [config.toml] [registrar-uri aor-uri]`
///
/// `SIPUA_USERNAME` and `SIPUA_PASSWORD` supply digest credentials for the
/// registration.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args.first().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    info!("Starting sipua {}", env!("CARGO_PKG_VERSION"));

    let bind: SocketAddr = format!("{}:{}", config.local.bind_address, config.local.port).parse()?;
    let transport = UdpTransport::new(bind);
    let (handle, mut events, task) =
        EngineRuntime::spawn(config, Box::new(StaticOfferAnswer::default()), transport).await?;
    info!("User agent listening on {}", handle.local_addr());

    if let (Some(registrar), Some(aor)) = (args.get(1).cloned(), args.get(2).cloned()) {
        let credential = match (std::env::var("SIPUA_USERNAME"), std::env::var("SIPUA_PASSWORD")) {
            (Ok(user), Ok(password)) => Some(Credential::any_realm(&user, &password)),
            _ => None,
        };
        handle
            .execute(move |engine: &mut Engine| {
                let id = engine.create_registration(RegistrationOptions::new(registrar, aor));
                if let Some(credential) = credential {
                    engine.authenticate(id, credential)?;
                }
                engine.register(id)
            })
            .await??;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(EngineEvent::Indication { handle: id, indication: Indication::IncomingCall { token, from, .. } }) => {
                    info!("Incoming call {} from {}, declining", id, from);
                    if let Err(e) = handle.respond(token, ResponseOptions::new(486)).await {
                        warn!("Failed to decline {}: {}", id, e);
                    }
                }
                Some(event) => info!("{:?}", event),
                None => break,
            },
        }
    }

    handle.shutdown();
    task.await?;
    Ok(())
}
