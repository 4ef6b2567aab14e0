use anyhow::{Result, Context, bail};
use std::process::Stdio;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::cli::config::BrowserSettings;

/// One chromedriver child plus the Chrome instance it drives.
///
/// A worker owns at most one of these at a time. Closing (or dropping) the
/// session kills the driver, which takes its browser down with it.
pub struct BrowserSession {
    driver: Option<WebDriver>,
    chromedriver: Option<Child>,
    port: u16,
}

impl BrowserSession {
    /// Spawn chromedriver on `driver_base_port + worker_id` and open a browser on it
    pub async fn launch(config: &BrowserSettings, worker_id: u32) -> Result<Self> {
        let port = config.driver_base_port.saturating_add(worker_id as u16);

        let child = Command::new(&config.chromedriver_path)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to start {}", config.chromedriver_path))?;

        debug!("chromedriver pid {:?} listening on port {}", child.id(), port);

        let mut session = Self {
            driver: None,
            chromedriver: Some(child),
            port,
        };

        if let Err(e) = session.connect(config).await {
            session.close().await;
            return Err(e);
        }

        info!("Browser session ready on port {}", port);
        Ok(session)
    }

    async fn connect(&mut self, config: &BrowserSettings) -> Result<()> {
        wait_for_port(self.port, Duration::from_secs(10)).await?;

        let mut caps = DesiredCapabilities::chrome();
        if config.headless {
            caps.set_headless()?;
        }
        caps.add_chrome_arg(&format!("--window-size={},{}", config.window_width, config.window_height))?;
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--ignore-certificate-errors")?;

        let driver = WebDriver::new(&format!("http://localhost:{}", self.port), caps)
            .await
            .context("Failed to connect to chromedriver")?;

        driver
            .set_page_load_timeout(Duration::from_secs(config.page_load_timeout_secs))
            .await?;

        self.driver = Some(driver);
        Ok(())
    }

    pub fn driver(&self) -> Result<&WebDriver, crate::error::PortalError> {
        self.driver
            .as_ref()
            .ok_or_else(|| crate::error::PortalError::BrowserDead("browser session not initialized".into()))
    }

    /// Quit the browser and kill the driver process
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                debug!("Error quitting browser: {}", e);
            }
        }

        if let Some(mut child) = self.chromedriver.take() {
            if let Err(e) = child.kill().await {
                error!("Error killing chromedriver on port {}: {}", self.port, e);
            }
            debug!("chromedriver on port {} stopped", self.port);
        }
    }
}

async fn wait_for_port(port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("chromedriver did not open port {} within {:?}", port, timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_wait_for_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_for_port(port, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(wait_for_port(port, Duration::from_millis(300)).await.is_err());
    }

    #[tokio::test]
    async fn test_launch_fails_without_driver() {
        let config = BrowserSettings {
            chromedriver_path: "/nonexistent/chromedriver".into(),
            ..crate::cli::config::HarvestConfig::default().browser
        };
        assert!(BrowserSession::launch(&config, 0).await.is_err());
    }
}
