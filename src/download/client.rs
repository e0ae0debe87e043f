use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Timeouts applied to every connection the fetcher opens.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for the whole request/response exchange.
    pub read: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            read: Duration::from_secs(30),
        }
    }
}

/// Creates the [`reqwest::Client`] used for all object downloads.
///
/// Redirects are disabled on the client: the fetcher follows `302` responses
/// itself so the chain length is capped and follow-up requests are reopened
/// without conditional headers.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.read)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::none())
        .build()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test;

    #[tokio::test]
    async fn client_does_not_follow_redirects() {
        test::setup();

        let server = test::Server::new();
        let client = create_client(&Default::default());

        let response = client
            .get(server.url("/redirect/data/ok"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 302);
    }
}
