//! Canned HTTP responses for the Open-Meteo backed tools.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::open_meteo::OpenMeteoClient;

pub const GEOCODING_PATH: &str = "/v1/search";
pub const FORECAST_PATH: &str = "/v1/forecast";

/// A route: request path, status line, JSON body.
pub type Route = (&'static str, &'static str, String);

pub struct FakeOpenMeteo {
    pub client: OpenMeteoClient,
    /// Request lines in arrival order, e.g. `GET /v1/search?name=Berlin&... HTTP/1.1`
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl FakeOpenMeteo {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Serve `routes` until the test ends; unmatched paths get a 404.
pub async fn serve(routes: Vec<Route>) -> FakeOpenMeteo {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let head = read_head(&mut socket).await;
            let line = head.lines().next().unwrap_or_default().to_string();
            let path = line.split_whitespace().nth(1).unwrap_or_default();
            let path = path.split('?').next().unwrap_or_default();
            let (status, body) = routes
                .iter()
                .find(|(p, _, _)| *p == path)
                .map(|(_, status, body)| (*status, body.clone()))
                .unwrap_or(("404 Not Found", "{}".to_string()));
            seen.lock().unwrap().push(line);
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });
    FakeOpenMeteo {
        client: OpenMeteoClient::new(
            format!("http://{addr}{GEOCODING_PATH}"),
            format!("http://{addr}{FORECAST_PATH}"),
            Duration::from_secs(5),
        ),
        requests,
    }
}

pub fn berlin() -> String {
    r#"{"results":[{"id":2950159,"name":"Berlin","latitude":52.52437,"longitude":13.41053,
        "country":"Germany","timezone":"Europe/Berlin"}],"generationtime_ms":0.8}"#
        .to_string()
}

pub fn berlin_forecast() -> String {
    r#"{"latitude":52.52,"longitude":13.419998,"utc_offset_seconds":7200,
        "timezone":"Europe/Berlin","timezone_abbreviation":"CEST",
        "current":{"time":"2026-06-01T12:00","interval":900,"temperature_2m":21.4,
        "wind_speed_10m":9.7,"weather_code":2}}"#
        .to_string()
}
