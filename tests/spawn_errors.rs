//! Integration tests for spawn classification, environment handling, and
//! file-backed stdio

use std::os::fd::IntoRawFd;

use nix::errno::Errno;
use procyon::{Command, OutputConfig, SpawnError, StdinConfig};

#[tokio::test]
async fn test_missing_executable_surfaces_exec_stage() {
    let result = Command::new("/usr/bin/404_not_found").spawn();
    match result {
        Err(SpawnError::Exec(Errno::ENOENT)) => {}
        other => panic!("Expected Exec(ENOENT), got: {:?}", other),
    }
    if let Err(e) = Command::new("/usr/bin/404_not_found").spawn() {
        assert_eq!(e.code(), "SPAWN005");
    }
}

#[tokio::test]
async fn test_custom_environment_replaces_everything() {
    let child = Command::new("/bin/sh")
        .args(["-c", "printf '%s' \"$PROCYON_ONLY:$HOME\""])
        .env_clear()
        .env("PROCYON_ONLY", "custom-value")
        .stdout(OutputConfig::pipe())
        .spawn()
        .expect("Failed to spawn sh");

    let output = child
        .wait_with_output(true, false)
        .await
        .expect("Failed to collect output");
    assert!(output.status.success());
    // HOME was not inherited; only the custom entry is visible.
    assert_eq!(String::from_utf8_lossy(&output.stdout), "custom-value:");
}

#[tokio::test]
async fn test_inherited_environment_with_override() {
    std::env::set_var("PROCYON_ITEST_INHERIT", "from-parent");
    let child = Command::new("/bin/sh")
        .args(["-c", "printf '%s' \"$PROCYON_ITEST_INHERIT\""])
        .env("PROCYON_ITEST_INHERIT", "overridden")
        .stdout(OutputConfig::pipe())
        .spawn()
        .expect("Failed to spawn sh");

    let output = child
        .wait_with_output(true, false)
        .await
        .expect("Failed to collect output");
    std::env::remove_var("PROCYON_ITEST_INHERIT");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "overridden");
}

#[tokio::test]
async fn test_arg0_override_is_visible_to_the_child() {
    let child = Command::new("/bin/sh")
        .arg0("procyon-shell")
        .args(["-c", "printf '%s' \"$0\""])
        .stdout(OutputConfig::pipe())
        .spawn()
        .expect("Failed to spawn sh");

    let output = child
        .wait_with_output(true, false)
        .await
        .expect("Failed to collect output");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "procyon-shell");
}

#[tokio::test]
async fn test_stdout_to_file_descriptor() {
    let path = "/tmp/procyon_test_stdout_file";
    let file = std::fs::File::create(path).expect("Failed to create fixture");

    let child = Command::new("/bin/sh")
        .args(["-c", "echo file-bound"])
        .stdout(OutputConfig::File {
            fd: file.into_raw_fd(),
            close_after_spawn: true,
        })
        .spawn()
        .expect("Failed to spawn sh");
    assert!(child.wait().await.success());

    let contents = std::fs::read_to_string(path).expect("Failed to read fixture");
    assert_eq!(contents.trim(), "file-bound");
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_stdin_from_file_descriptor() {
    let path = "/tmp/procyon_test_stdin_file";
    std::fs::write(path, "a\nb\n").expect("Failed to write fixture");
    let file = std::fs::File::open(path).expect("Failed to open fixture");

    let child = Command::new("/usr/bin/wc")
        .arg("-l")
        .stdin(StdinConfig::File {
            fd: file.into_raw_fd(),
            close_after_spawn: true,
        })
        .stdout(OutputConfig::pipe())
        .spawn()
        .expect("Failed to spawn wc");

    let output = child
        .wait_with_output(true, false)
        .await
        .expect("Failed to collect output");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "2");
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_pipe_buffer_size_hint_is_accepted() {
    let child = Command::new("/bin/cat")
        .stdin(StdinConfig::Pipe {
            buffer_size: Some(65536),
        })
        .stdout(OutputConfig::Pipe {
            buffer_size: Some(65536),
        })
        .spawn()
        .expect("Failed to spawn cat with sized pipes");

    child.stdin().unwrap().close().expect("Failed to close stdin");
    assert!(child.wait().await.success());
}
