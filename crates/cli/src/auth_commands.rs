use std::io::BufRead;

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    keyward_oauth::{Session, SessionStatus},
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in through the browser.
    Login {
        /// Redirect URI the browser landed on. Read from stdin when omitted.
        #[arg(long)]
        redirect: Option<String>,
    },
    /// Show whether a session is active and when it expires.
    Status,
    /// Refresh the access token now.
    Refresh,
    /// Forget the stored credential.
    Logout,
}

pub async fn handle_auth(session: &Session, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Login { redirect } => login(session, redirect).await,
        AuthAction::Status => {
            println!("{}", describe(&session.status()));
            Ok(())
        },
        AuthAction::Refresh => {
            let credential = session.refresh().await?;
            println!(
                "Refreshed ({})",
                describe_expiry(credential.expires_at().map(|at| {
                    at.saturating_sub(keyward_oauth::types::now_secs())
                }))
            );
            Ok(())
        },
        AuthAction::Logout => {
            session.logout()?;
            println!("Logged out");
            Ok(())
        },
    }
}

async fn login(session: &Session, redirect: Option<String>) -> Result<()> {
    let flow = session.login();

    // A redirect given on the command line comes from an earlier browser
    // round trip, so its state cannot be checked against a fresh one.
    let (redirect, expected_state) = match redirect {
        Some(redirect) => (redirect, None),
        None => {
            let req = flow.start()?;
            println!("Opening browser for authentication...");
            if open::that(&req.url).is_err() {
                println!("Could not open browser. Please visit:\n{}", req.url);
            }
            println!("Paste the URI the browser was redirected to:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read redirect URI")?;
            (line.trim().to_string(), Some(req.state))
        },
    };

    flow.complete(&redirect, expected_state.as_deref()).await?;
    println!("Successfully logged in");
    Ok(())
}

fn describe(status: &SessionStatus) -> String {
    match status {
        SessionStatus::LoggedOut => "Not logged in.".to_string(),
        SessionStatus::Expired => "Logged in [expired, will refresh on next request]".to_string(),
        SessionStatus::Active {
            expires_in_secs,
            scope,
        } => {
            let scope = scope
                .as_deref()
                .map(|s| format!(" scope={s}"))
                .unwrap_or_default();
            format!("Logged in [{}]{scope}", describe_expiry(*expires_in_secs))
        },
    }
}

fn describe_expiry(expires_in_secs: Option<u64>) -> String {
    match expires_in_secs {
        None => "no expiry".to_string(),
        Some(remaining) => {
            let hours = remaining / 3600;
            let mins = (remaining % 3600) / 60;
            format!("valid ({hours}h {mins}m remaining)")
        },
    }
}
