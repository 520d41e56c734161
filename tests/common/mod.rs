#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Helper struct for E2E test environment
pub struct TestEnv {
    temp_dir: TempDir,
    tether_bin: PathBuf,
    state_dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment with an isolated state directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join("state");
        fs::create_dir_all(&state_dir).unwrap();
        fs::create_dir_all(temp_dir.path().join("project")).unwrap();

        Self {
            temp_dir,
            tether_bin: PathBuf::from(env!("CARGO_BIN_EXE_tether")),
            state_dir,
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.temp_dir.path().join("project")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("tether.lock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("tether.pid")
    }

    pub fn service_log(&self) -> PathBuf {
        self.state_dir.join("logs").join("service.log")
    }

    /// A file under the project dir that services can touch to prove they ran
    pub fn marker(&self, name: &str) -> PathBuf {
        self.project_dir().join(name)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.tether_bin);
        cmd.args(args)
            .current_dir(self.project_dir())
            .env("TETHER_STATE_DIR", &self.state_dir)
            .env("TETHER_LOG", "debug");
        for var in [
            "TETHER_PORT",
            "TETHER_HOST",
            "TETHER_HEALTH_PATH",
            "TETHER_ATTEMPTS",
            "TETHER_INTERVAL",
            "TETHER_LOCK_FILE",
            "TETHER_PID_FILE",
            "TETHER_LOGS_DIR",
            "TETHER_KILL_ON_TIMEOUT",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }

    /// Run a tether command and return the output
    pub fn run_command(&self, args: &[&str]) -> Output {
        let output = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .expect("Failed to execute tether command");
        println!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        println!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        output
    }

    /// Run a tether command in the background
    pub fn run_background(&self, args: &[&str]) -> Child {
        self.command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn tether command")
    }

    pub fn read_logs(&self) -> String {
        fs::read_to_string(self.state_dir.join("logs").join("tether.log")).unwrap_or_default()
    }

    pub fn read_pid(&self) -> Option<u32> {
        read_pid_file(&self.pid_file())
    }

    pub fn read_lock_pid(&self) -> Option<u32> {
        read_pid_file(&self.lock_file())
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        // don't leave services running if a test fails halfway
        for pid in [self.read_pid(), self.read_lock_pid()]
            .into_iter()
            .flatten()
        {
            kill(pid, libc::SIGKILL);
        }
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

pub fn kill(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

/// Polls `cond` every 50ms until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

/// Waits for `child` to exit and returns its exit code, killing it after
/// `timeout`
pub fn wait_child(child: &mut Child, timeout: Duration) -> Option<i32> {
    let mut status = None;
    wait_until(timeout, || {
        status = child.try_wait().ok().flatten();
        status.is_some()
    });
    if status.is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }
    status.and_then(|s| s.code())
}

pub fn port_open(port: u16) -> bool {
    std::net::TcpStream::connect_timeout(&([127, 0, 0, 1], port).into(), Duration::from_millis(200))
        .is_ok()
}

/// Serves `200 OK` to every HTTP request on `port` from a background thread
pub fn serve_healthy(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let mut buf = [0u8; 1024];
            if matches!(stream.read(&mut buf), Ok(n) if n > 0) {
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                );
            }
        }
    });
}

/// Arguments for a service that answers HTTP on `port`; `/` lists the
/// project dir with a 200
pub fn http_service(port: u16) -> Vec<String> {
    vec![
        "python3".to_string(),
        "-m".to_string(),
        "http.server".to_string(),
        "--bind".to_string(),
        "127.0.0.1".to_string(),
        port.to_string(),
    ]
}

/// A separate process that accepts TCP connections on `port` but never
/// answers HTTP
pub fn spawn_squatter(port: u16) -> Child {
    let script = format!(
        "import socket, time\n\
         s = socket.socket()\n\
         s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
         s.bind(('127.0.0.1', {port}))\n\
         s.listen(16)\n\
         time.sleep(60)\n"
    );
    Command::new("python3")
        .args(["-c", &script])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn squatter")
}
