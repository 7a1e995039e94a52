//! User agent rotation for browser sessions.

use rand::prelude::*;

/// Default user agents if none are configured.
const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

/// Pick a random user agent from the configured pool or defaults.
pub fn pick_user_agent(pool: Option<&[String]>) -> String {
    let mut rng = thread_rng();

    let picked = match pool {
        Some(agents) if !agents.is_empty() => agents.choose(&mut rng).cloned(),
        _ => DEFAULT_USER_AGENTS
            .choose(&mut rng)
            .map(|ua| ua.to_string()),
    };
    picked.unwrap_or_default()
}

/// Chromium command-line arguments for a new session.
pub fn browser_args(user_agent: &str, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--user-agent={user_agent}"),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--window-size=1366,768".to_string(),
        "--lang=en-US".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args
}
