//! 集成测试：配置加载、状态文件、sensor 注册表

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use data_forwarder::config;
use data_forwarder::registrar::{load_state, save_state, Registrar};
use data_forwarder::sensor::{Driver, Registry};
use data_forwarder::{DataEvent, Error, FileState, StateTable};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ==================== 配置 ====================

#[test]
fn test_load_config_directory() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("10-network.json"),
        r#"
# collectors
{
  "network": {
    "servers": ["logs-1.example.com:5043"],
    "timeout": 30
  }
}
"#,
    )
    .unwrap();
    fs::write(
        tmp.path().join("20-files.json"),
        r#"{
  "network": { "servers": ["logs-2.example.com:5043"] },
  "files": [
    # syslog
    { "paths": ["/var/log/messages", "/var/log/*.log"], "fields": { "type": "syslog" } },
    { "paths": ["/var/log/apache/access.log"], "dead time": "1h30m" }
  ]
}"#,
    )
    .unwrap();
    fs::write(tmp.path().join("30-empty.json"), "").unwrap();

    let config = config::load(tmp.path()).unwrap();
    assert_eq!(
        config.network.servers,
        vec!["logs-1.example.com:5043", "logs-2.example.com:5043"]
    );
    assert_eq!(config.network.timeout(), Duration::from_secs(30));
    assert_eq!(config.files.len(), 2);
    assert_eq!(config.files[0].fields["type"], "syslog");
    assert_eq!(config.files[0].dead_time(), Duration::from_secs(24 * 3600));
    assert_eq!(config.files[1].dead_time(), Duration::from_secs(5400));
    assert!(!config.network.tls_enabled());
}

#[test]
fn test_load_config_rejects_conflicts() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("a.json"),
        r#"{"network": {"servers": ["a:1"], "timeout": 10}, "files": [{"paths": ["/x"]}]}"#,
    )
    .unwrap();
    fs::write(tmp.path().join("b.json"), r#"{"network": {"timeout": 20}}"#).unwrap();

    let err = config::load(tmp.path()).unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("timeout already defined"));
}

#[test]
fn test_load_config_usage_errors() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("forwarder.json");

    // 客户端证书缺少 CA
    fs::write(
        &path,
        r#"{"network": {"servers": ["a:1"], "ssl certificate": "/c.pem", "ssl key": "/k.pem"},
            "files": [{"paths": ["/x"]}]}"#,
    )
    .unwrap();
    assert!(config::load(&path).unwrap_err().is_config());

    // dead time 无法解析
    fs::write(
        &path,
        r#"{"network": {"servers": ["a:1"]}, "files": [{"paths": ["/x"], "dead time": "forever"}]}"#,
    )
    .unwrap();
    assert!(config::load(&path).unwrap_err().is_config());

    // 不是 JSON
    fs::write(&path, "servers = a:1\n").unwrap();
    assert!(config::load(&path).unwrap_err().is_config());
}

#[test]
fn test_load_config_size_limit() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("huge.json");
    let file = fs::File::create(&path).unwrap();
    file.set_len((10 << 20) + 1).unwrap();

    let err = config::load(&path).unwrap_err();
    assert!(err.to_string().contains("exceeds limit"));
}

// ==================== 状态文件 ====================

fn event(source: &str, offset: u64, line: u64) -> DataEvent {
    DataEvent {
        source: Arc::from(source),
        offset,
        line,
        text: String::new(),
        fields: Default::default(),
        identity: None,
    }
}

#[test]
fn test_state_file_format() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".data-forwarder");

    let mut table = StateTable::new();
    table.insert(
        "/var/log/app.log".into(),
        FileState::new("/var/log/app.log", None).at(120, 7),
    );
    save_state(&path, &table).unwrap();

    let raw = fs::read_to_string(&path).unwrap();
    assert_eq!(raw, r#"{"/var/log/app.log":{"offset":120,"line":7}}"#);

    let loaded = load_state(&path).unwrap();
    assert_eq!(loaded["/var/log/app.log"].source, "/var/log/app.log");
    assert_eq!(loaded["/var/log/app.log"].offset, 120);
}

#[test]
fn test_corrupt_state_file_is_error() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".data-forwarder");
    fs::write(&path, "{\"/var/log/app.log\": {\"offset\": ").unwrap();

    assert!(matches!(load_state(&path), Err(Error::Serialization(_))));
}

#[tokio::test]
async fn test_state_file_always_complete() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".data-forwarder");

    let (tx, rx) = mpsc::channel(1);
    let registrar = tokio::spawn(Registrar::new(path.clone(), StateTable::new()).run(rx));

    // 写入的同时反复读取，每次都必须是完整的 JSON
    let done = Arc::new(AtomicBool::new(false));
    let reader_done = done.clone();
    let reader_path = path.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let mut reads = 0;
        loop {
            let finished = reader_done.load(Ordering::SeqCst);
            if let Ok(data) = fs::read(&reader_path) {
                let table: StateTable = serde_json::from_slice(&data).expect("partial state file");
                assert!(table.len() <= 3);
                reads += 1;
            }
            if finished {
                return reads;
            }
        }
    });

    for i in 1..=200u64 {
        let batch = vec![
            event("/var/log/a.log", i * 10, i),
            event("/var/log/b.log", i * 20, i),
            event("/var/log/c.log", i * 30, i),
        ];
        tx.send(batch).await.unwrap();
    }
    drop(tx);

    let states = registrar.await.unwrap();
    done.store(true, Ordering::SeqCst);
    assert!(reader.await.unwrap() > 0);
    assert_eq!(states["/var/log/c.log"].offset, 6000);

    let on_disk = load_state(&path).unwrap();
    assert_eq!(on_disk["/var/log/a.log"].offset, 2000);
    assert_eq!(on_disk["/var/log/b.log"].line, 200);
}

// ==================== Sensor ====================

/// 读取配置目录中以自己名字命名的文件
struct FileSensor {
    name: &'static str,
    loads: AtomicUsize,
}

impl Driver for FileSensor {
    fn load_config(&self, file_or_directory: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let path = file_or_directory.join(format!("{}.sensor", self.name));
        fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_sensor_registry_load_all() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("mysql.sensor"), "port=3306\n").unwrap();

    let mysql = Arc::new(FileSensor {
        name: "mysql",
        loads: AtomicUsize::new(0),
    });
    let nginx = Arc::new(FileSensor {
        name: "nginx",
        loads: AtomicUsize::new(0),
    });

    let mut registry = Registry::new();
    registry.register("nginx", nginx.clone()).unwrap();
    registry.register("mysql", mysql.clone()).unwrap();
    assert!(matches!(
        registry.register("mysql", mysql.clone()),
        Err(Error::Sensor(_))
    ));
    assert_eq!(registry.names(), vec!["mysql", "nginx"]);

    let failed = registry.load_all(tmp.path());
    assert_eq!(failed, vec!["nginx"]);
    assert_eq!(mysql.loads.load(Ordering::SeqCst), 1);
    assert_eq!(nginx.loads.load(Ordering::SeqCst), 0);

    assert!(registry.get("mysql").is_ok());
    assert!(matches!(registry.get("redis"), Err(Error::Sensor(_))));
}
