use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

use shmqueue::{QueueError, SharedQueue, ShmemConfig};

const WORKER: &str = env!("CARGO_BIN_EXE_shmq-worker");

fn pool_name(test: &str) -> String {
    format!("shmq-proc-{}-{}", test, std::process::id())
}

fn config(name: &str) -> ShmemConfig {
    ShmemConfig::builder()
        .name(name)
        .size(4 << 20)
        .lock_timeout(Some(Duration::from_secs(10)))
        .wait_slice(Duration::from_millis(10))
        .build()
        .expect("valid test config")
}

fn worker(name: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(WORKER);
    cmd.args(["--name", name]).args(args).stderr(Stdio::null());
    cmd
}

fn finish(child: Child) -> Output {
    let output = child.wait_with_output().expect("worker did not run");
    assert!(output.status.success(), "worker failed: {:?}", output.status);
    output
}

#[test]
fn producer_and_consumer_processes_share_every_item() -> Result<(), Box<dyn std::error::Error>> {
    const PRODUCERS: usize = 3;
    const CONSUMERS: usize = 2;
    const ITEMS: usize = 200;

    let name = pool_name("fan");
    let queue = SharedQueue::create(&config(&name))?;

    let consumers: Vec<Child> = (0..CONSUMERS)
        .map(|_| worker(&name, &["consume"]).stdout(Stdio::piped()).spawn())
        .collect::<Result<_, _>>()?;
    let producers: Vec<Child> = (0..PRODUCERS)
        .map(|p| {
            worker(&name, &["produce", "--count", &ITEMS.to_string(), "--tag", &p.to_string()])
                .stdout(Stdio::null())
                .spawn()
        })
        .collect::<Result<_, _>>()?;

    for producer in producers {
        finish(producer);
    }
    queue.close()?;

    let mut seen = HashSet::new();
    let mut total = 0;
    for consumer in consumers {
        let output = finish(consumer);
        for line in String::from_utf8(output.stdout)?.lines() {
            total += 1;
            seen.insert(line.to_string());
        }
    }
    assert_eq!(total, PRODUCERS * ITEMS);
    assert_eq!(seen.len(), PRODUCERS * ITEMS);
    for p in 0..PRODUCERS {
        assert!(seen.contains(&format!("{}:{}", p, ITEMS - 1)));
    }
    assert!(queue.empty()?);
    queue.destroy();
    Ok(())
}

#[test]
fn cli_lifecycle_create_produce_close_consume_destroy() -> Result<(), Box<dyn std::error::Error>> {
    let name = pool_name("cli");
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("worker.toml");
    let mut file = File::create(&config_path)?;
    write!(
        file,
        "[shmem]\nname = \"{}\"\nsize = 1048576\nlock_timeout_ms = 5000\nwait_slice_ms = 10\n",
        name
    )?;
    drop(file);
    let config_path = config_path.to_str().expect("utf-8 path");

    let run = |args: &[&str]| {
        let output = Command::new(WORKER)
            .args(["--config", config_path])
            .args(args)
            .stderr(Stdio::null())
            .output()
            .expect("worker did not run");
        assert!(output.status.success(), "{:?} failed: {:?}", args, output.status);
        String::from_utf8(output.stdout).expect("utf-8 output")
    };

    run(&["create"]);
    run(&["produce", "--count", "3", "--tag", "job"]);
    assert!(run(&["stat"]).contains("len: 3"));
    run(&["close"]);
    assert_eq!(run(&["consume"]), "job:0\njob:1\njob:2\n");
    assert!(run(&["stat"]).contains("closed: true"));
    run(&["destroy"]);

    assert!(matches!(SharedQueue::attach(&config(&name)), Err(QueueError::NotFound(_))));
    Ok(())
}

#[test]
fn consumer_honours_max_and_idle_timeout() -> Result<(), Box<dyn std::error::Error>> {
    let name = pool_name("max");
    let queue = SharedQueue::create(&config(&name))?;
    for i in 0..5 {
        queue.put(format!("item-{}", i).as_bytes())?;
    }

    let output = finish(worker(&name, &["consume", "--max", "2"]).stdout(Stdio::piped()).spawn()?);
    assert_eq!(String::from_utf8(output.stdout)?, "item-0\nitem-1\n");
    assert_eq!(queue.qsize()?, 3);

    // The queue stays open, so draining ends with the idle timeout, which is an error.
    let output = worker(&name, &["consume", "--idle-timeout-ms", "100"])
        .stdout(Stdio::piped())
        .spawn()?
        .wait_with_output()?;
    assert!(!output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?, "item-2\nitem-3\nitem-4\n");
    queue.destroy();
    Ok(())
}
