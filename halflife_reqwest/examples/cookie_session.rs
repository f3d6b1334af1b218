use std::sync::Arc;

use clap::Parser;
use halflife_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
use halflife_tokens::{
    sources::{CookieJarStore, HttpRefreshEndpoint},
    TokenManager, TokenManagerConfig,
};
use predicates::prelude::PredicateBooleanExt;
use reqwest::{cookie::Jar, Url};
use reqwest_middleware::ClientBuilder;

#[derive(Debug, Parser)]
struct Opts {
    /// The application's base URL; the credential cookie is read for this URL
    #[clap(short, long, env)]
    app_url: Url,

    /// The path the server reissues credentials at
    #[clap(short, long, env, default_value = "/auth/refresh")]
    refresh_path: String,

    /// The name of the cookie holding the credential
    #[clap(short = 'n', long, env, default_value = "bearer")]
    cookie_name: String,

    /// A session cookie (`name=value`) to seed the jar with
    #[clap(short, long, env, hide_env_values = true)]
    session_cookie: Option<String>,

    /// Fire the login hook even when no credential has been issued yet
    #[clap(long, env)]
    always_request_login: bool,

    /// The resource to fetch with the credential attached
    #[clap(default_value = "/")]
    path: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let jar = Arc::new(Jar::default());
    if let Some(cookie) = &opts.session_cookie {
        jar.add_cookie_str(cookie, &opts.app_url);
    }

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .cookie_provider(jar.clone())
        .build()?;

    let config = TokenManagerConfig {
        always_request_login: opts.always_request_login,
        ..TokenManagerConfig::new(opts.cookie_name)
    };

    let manager = TokenManager::builder(
        CookieJarStore::new(jar, opts.app_url.clone()),
        HttpRefreshEndpoint::new(client.clone(), opts.app_url.join(&opts.refresh_path)?),
    )
    .with_config(config)
    .build();

    manager.on_need_login().add(|manager: TokenManager| async move {
        tracing::warn!(
            subject = ?manager.current_subject(),
            "session can no longer be refreshed, log in again"
        );
        Some(false)
    });

    let host = opts.app_url.host_str().unwrap_or_default().to_owned();
    let client = ClientBuilder::new(client)
        .with(
            AccessTokenMiddleware::new(manager.clone())
                .with_predicate(HttpsOnly.and(ExactHostMatch::new(host))),
        )
        .build();

    let resp = client.get(opts.app_url.join(&opts.path)?).send().await?;

    tracing::info!(
        status = resp.status().as_u16(),
        subject = ?manager.current_subject(),
        schedule = ?manager.schedule(),
        "fetched resource"
    );

    println!("{}", resp.text().await?);

    Ok(())
}
