mod setup;

use predicates::boolean::PredicateBooleanExt;
use predicates::str::contains;

use crate::setup::{DEFAULT_TIMEOUT, make_cli};

#[test]
fn server_listens_on_bind_addr() {
    let mut cmd = make_cli();

    let assert = cmd
        .timeout(DEFAULT_TIMEOUT)
        .env_remove("NATIVESRV_PASSWORD")
        .args(["--bind", "127.0.0.1:0"])
        .assert();

    // The server runs until killed.
    assert
        .interrupted()
        .stdout(contains("Listening for native protocol connections on 127.0.0.1:"));
}

#[test]
fn user_requires_password() {
    let mut cmd = make_cli();

    let assert = cmd
        .timeout(DEFAULT_TIMEOUT)
        .env_remove("NATIVESRV_PASSWORD")
        .args(["--bind", "127.0.0.1:0", "-u", "test"])
        .assert();

    assert.failure().stderr(
        contains("the following required arguments were not provided:")
            .and(contains("--password <PASSWORD>")),
    );
}

#[test]
fn rejects_invalid_chunked_mode() {
    let mut cmd = make_cli();

    let assert = cmd
        .timeout(DEFAULT_TIMEOUT)
        .args(["--bind", "127.0.0.1:0", "--send-chunked", "sometimes"])
        .assert();

    assert
        .failure()
        .stderr(contains("invalid chunked mode 'sometimes'"));
}

#[test]
fn rejects_invalid_interserver_secret() {
    let mut cmd = make_cli();

    let assert = cmd
        .timeout(DEFAULT_TIMEOUT)
        .args(["--bind", "127.0.0.1:0", "--interserver-secret", "nosecret"])
        .assert();

    assert
        .failure()
        .stderr(contains("expected 'cluster=secret'"));
}

#[test]
fn fails_on_unusable_bind_addr() {
    let mut cmd = make_cli();

    let assert = cmd
        .timeout(DEFAULT_TIMEOUT)
        .args(["--bind", "not an address"])
        .assert();

    assert.failure();
}
