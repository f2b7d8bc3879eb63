//! End-to-end protocol exercises: nut issuance, signed client hops, and
//! the TIF outcome of every command.

use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use url::form_urlencoded;

use sqrl_ssp::authenticator::Authenticator;
use sqrl_ssp::codec::sqrl64_encode;
use sqrl_ssp::config::SspConfig;
use sqrl_ssp::engine::{PagError, SspEngine};
use sqrl_ssp::error::Result as SspResult;
use sqrl_ssp::hoard::MemoryHoard;
use sqrl_ssp::identity::{IdentityStore, MemoryIdentityStore, SqrlIdentity};
use sqrl_ssp::nut::{Nut, RandomNutSource};
use sqrl_ssp::response::{CliResponse, Tif};

const CLIENT_IP: &str = "198.51.100.7";
const OTHER_IP: &str = "203.0.113.9";

struct StubAuthenticator;

#[async_trait]
impl Authenticator for StubAuthenticator {
    async fn authenticate_identity(&self, identity: &SqrlIdentity) -> String {
        format!("https://sso.example.com/finish?idk={}", identity.idk)
    }

    async fn swap_identities(&self, _previous: &SqrlIdentity, _next: &SqrlIdentity) -> SspResult<()> {
        Ok(())
    }

    async fn remove_identity(&self, _identity: &SqrlIdentity) -> SspResult<()> {
        Ok(())
    }
}

struct Harness {
    engine: SspEngine,
    identities: Arc<MemoryIdentityStore>,
}

fn harness() -> Harness {
    let identities = Arc::new(MemoryIdentityStore::new());
    let engine = SspEngine::new(
        Arc::new(RandomNutSource::new(8).unwrap()),
        Arc::new(MemoryHoard::new()),
        identities.clone(),
        Arc::new(StubAuthenticator),
        SspConfig::default(),
    );
    Harness { engine, identities }
}

/// A scripted SQRL client holding a site keypair and an unlock keypair.
struct Client {
    site: SigningKey,
    unlock: SigningKey,
}

impl Client {
    fn new(seed: u8) -> Self {
        Client {
            site: SigningKey::from_bytes(&[seed; 32]),
            unlock: SigningKey::from_bytes(&[seed.wrapping_add(100); 32]),
        }
    }

    fn idk(&self) -> String {
        sqrl64_encode(self.site.verifying_key().as_bytes())
    }

    fn suk(&self) -> String {
        sqrl64_encode(format!("suk-material-{}", self.idk()).as_bytes())
    }

    fn vuk(&self) -> String {
        sqrl64_encode(self.unlock.verifying_key().as_bytes())
    }

    fn identity(&self) -> SqrlIdentity {
        SqrlIdentity {
            idk: self.idk(),
            suk: self.suk(),
            vuk: self.vuk(),
            ..SqrlIdentity::default()
        }
    }

    fn client_block(&self, cmd: &str, opts: &[&str], pidk: Option<&str>) -> String {
        let mut block = String::new();
        block.push_str("ver=1\r\n");
        block.push_str(&format!("cmd={cmd}\r\n"));
        if !opts.is_empty() {
            block.push_str(&format!("opt={}\r\n", opts.join("~")));
        }
        block.push_str(&format!("idk={}\r\n", self.idk()));
        block.push_str(&format!("suk={}\r\n", self.suk()));
        block.push_str(&format!("vuk={}\r\n", self.vuk()));
        if let Some(pidk) = pidk {
            block.push_str(&format!("pidk={pidk}\r\n"));
        }
        sqrl64_encode(block.as_bytes())
    }
}

/// Build a signed `cli.sqrl` form body. `previous` adds `pidk`/`pids`;
/// `unlock` adds `urs` signed by that key.
fn envelope(
    client: &Client,
    cmd: &str,
    opts: &[&str],
    server: &str,
    previous: Option<&Client>,
    unlock: Option<&SigningKey>,
) -> Vec<u8> {
    let pidk = previous.map(Client::idk);
    let client_encoded = client.client_block(cmd, opts, pidk.as_deref());
    let mut signed = client_encoded.clone().into_bytes();
    signed.extend_from_slice(server.as_bytes());

    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair("client", &client_encoded);
    form.append_pair("server", server);
    form.append_pair("ids", &sqrl64_encode(&client.site.sign(&signed).to_bytes()));
    if let Some(previous) = previous {
        form.append_pair("pids", &sqrl64_encode(&previous.site.sign(&signed).to_bytes()));
    }
    if let Some(unlock) = unlock {
        form.append_pair("urs", &sqrl64_encode(&unlock.sign(&signed).to_bytes()));
    }
    form.finish().into_bytes()
}

fn first_server(nut: &Nut) -> String {
    format!("sqrl://example.com/cli.sqrl?nut={nut}")
}

async fn hop(engine: &SspEngine, nut: &Nut, body: Vec<u8>, ip: &str) -> (CliResponse, String) {
    let encoded = engine.cli(Some(nut.clone()), &body, ip).await;
    let response = CliResponse::decode(&encoded).expect("well-formed response");
    (response, String::from_utf8(encoded).unwrap())
}

fn tif(flags: &[Tif]) -> Tif {
    let mut tif = Tif::default();
    for flag in flags {
        tif.set(*flag);
    }
    tif
}

#[tokio::test]
async fn fresh_login_without_cps() {
    let Harness { engine, .. } = harness();
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let client = Client::new(1);

    let body = envelope(&client, "query", &[], &first_server(&n0), None, None);
    let (query_response, query_echo) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(query_response.tif, tif(&[Tif::IP_MATCHED]));
    let n1 = query_response.nut.clone();
    assert_ne!(n1, n0);
    assert_eq!(query_response.qry, format!("/cli.sqrl?nut={n1}"));

    let body = envelope(&client, "ident", &["suk"], &query_echo, None, None);
    let (ident_response, _) = hop(&engine, &n1, body, CLIENT_IP).await;
    assert_eq!(ident_response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));
    assert_eq!(ident_response.suk.as_deref(), Some(client.suk().as_str()));
    assert!(ident_response.url.is_none(), "no CPS url without opt=cps");

    let url = engine.resolve_pag(&n0, &session.pag_nut).await.unwrap();
    assert_eq!(url, format!("https://sso.example.com/finish?idk={}", client.idk()));

    // The pag entry is one-shot.
    assert!(matches!(
        engine.resolve_pag(&n0, &session.pag_nut).await,
        Err(PagError::UnknownNut)
    ));
}

#[tokio::test]
async fn cps_login_returns_url_and_skips_the_pag_entry() {
    let Harness { engine, .. } = harness();
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let client = Client::new(2);

    let body = envelope(&client, "ident", &["cps"], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));
    assert_eq!(
        response.url.as_deref(),
        Some(format!("https://sso.example.com/finish?idk={}", client.idk()).as_str())
    );

    assert!(matches!(
        engine.resolve_pag(&n0, &session.pag_nut).await,
        Err(PagError::UnknownNut)
    ));
}

#[tokio::test]
async fn rekey_swaps_identities_and_clears_the_previous_match() {
    let Harness { engine, identities } = harness();
    let old = Client::new(10);
    identities.save_identity(&old.identity()).await.unwrap();

    let new = Client::new(20);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&new, "query", &[], &first_server(&n0), Some(&old), None);
    let (query_response, query_echo) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(query_response.tif, tif(&[Tif::PREVIOUS_ID_MATCH, Tif::IP_MATCHED]));

    let body = envelope(&new, "ident", &[], &query_echo, Some(&old), None);
    let (ident_response, _) = hop(&engine, &query_response.nut, body, CLIENT_IP).await;
    assert_eq!(ident_response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));
    assert!(!ident_response.tif.contains(Tif::PREVIOUS_ID_MATCH));

    // The old idk now resolves to its successor through the rekey link.
    let successor = identities.find_identity(&old.idk()).await.unwrap().expect("successor");
    assert_eq!(successor.idk, new.idk());
    assert_eq!(successor.pidk.as_deref(), Some(old.idk().as_str()));
}

#[tokio::test]
async fn disable_then_ident_is_rejected() {
    let Harness { engine, identities } = harness();
    let client = Client::new(30);
    identities.save_identity(&client.identity()).await.unwrap();

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "disable", &[], &first_server(&n0), None, None);
    let (disable_response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(
        disable_response.tif,
        tif(&[Tif::ID_MATCH, Tif::IP_MATCHED, Tif::SQRL_DISABLED])
    );
    let stored = identities.find_identity(&client.idk()).await.unwrap().unwrap();
    assert!(stored.disabled);

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "ident", &[], &first_server(&n0), None, None);
    let (ident_response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(
        ident_response.tif,
        tif(&[Tif::ID_MATCH, Tif::IP_MATCHED, Tif::SQRL_DISABLED, Tif::COMMAND_FAILED])
    );
    assert!(ident_response.url.is_none());
    assert!(matches!(
        engine.resolve_pag(&n0, &session.pag_nut).await,
        Err(PagError::UnknownNut)
    ));
}

#[tokio::test]
async fn enable_with_a_bad_urs_leaves_the_identity_disabled() {
    let Harness { engine, identities } = harness();
    let client = Client::new(40);
    let mut identity = client.identity();
    identity.disabled = true;
    identities.save_identity(&identity).await.unwrap();

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let wrong_key = SigningKey::from_bytes(&[99; 32]);
    let body = envelope(&client, "enable", &[], &first_server(&n0), None, Some(&wrong_key));
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(
        response.tif,
        tif(&[
            Tif::ID_MATCH,
            Tif::IP_MATCHED,
            Tif::SQRL_DISABLED,
            Tif::CLIENT_FAILURE,
            Tif::COMMAND_FAILED,
        ])
    );
    let stored = identities.find_identity(&client.idk()).await.unwrap().unwrap();
    assert!(stored.disabled, "identity must stay disabled");
}

#[tokio::test]
async fn enable_with_the_right_urs_reauthenticates() {
    let Harness { engine, identities } = harness();
    let client = Client::new(50);
    let mut identity = client.identity();
    identity.disabled = true;
    identities.save_identity(&identity).await.unwrap();

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "enable", &[], &first_server(&n0), None, Some(&client.unlock));
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));

    let stored = identities.find_identity(&client.idk()).await.unwrap().unwrap();
    assert!(!stored.disabled);
    assert!(engine.resolve_pag(&n0, &session.pag_nut).await.is_ok());
}

#[tokio::test]
async fn remove_deletes_the_identity() {
    let Harness { engine, identities } = harness();
    let client = Client::new(60);
    identities.save_identity(&client.identity()).await.unwrap();

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "remove", &[], &first_server(&n0), None, Some(&client.unlock));
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));
    assert!(identities.find_identity(&client.idk()).await.unwrap().is_none());
}

#[tokio::test]
async fn ip_mismatch_fails_unless_noiptest_is_set() {
    let Harness { engine, .. } = harness();
    let client = Client::new(70);

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "query", &[], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, OTHER_IP).await;
    assert_eq!(response.tif, tif(&[Tif::COMMAND_FAILED]));

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "query", &["noiptest"], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, OTHER_IP).await;
    assert_eq!(response.tif, Tif::default(), "no IP_MATCHED bit under noiptest");
}

#[tokio::test]
async fn replaying_a_consumed_nut_fails() {
    let Harness { engine, .. } = harness();
    let client = Client::new(80);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&client, "query", &[], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body.clone(), CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::IP_MATCHED]));

    let (replayed, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(replayed.tif, tif(&[Tif::CLIENT_FAILURE, Tif::COMMAND_FAILED]));
}

#[tokio::test]
async fn wrong_server_echo_fails_the_chain() {
    let Harness { engine, .. } = harness();
    let client = Client::new(90);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&client, "query", &[], &first_server(&n0), None, None);
    let (query_response, query_echo) = hop(&engine, &n0, body, CLIENT_IP).await;

    // Signed correctly over a server blob that is not our previous response.
    let tampered = format!("{query_echo}x");
    let body = envelope(&client, "ident", &[], &tampered, None, None);
    let (response, _) = hop(&engine, &query_response.nut, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::COMMAND_FAILED]));
}

#[tokio::test]
async fn changing_idk_mid_chain_is_a_bad_association() {
    let Harness { engine, .. } = harness();
    let first = Client::new(100);
    let second = Client::new(110);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&first, "query", &[], &first_server(&n0), None, None);
    let (query_response, query_echo) = hop(&engine, &n0, body, CLIENT_IP).await;

    let body = envelope(&second, "ident", &[], &query_echo, None, None);
    let (response, _) = hop(&engine, &query_response.nut, body, CLIENT_IP).await;
    assert_eq!(
        response.tif,
        tif(&[
            Tif::IP_MATCHED,
            Tif::CLIENT_FAILURE,
            Tif::COMMAND_FAILED,
            Tif::BAD_ID_ASSOCIATION,
        ])
    );
}

#[tokio::test]
async fn bad_signature_does_not_consume_the_nut() {
    let Harness { engine, .. } = harness();
    let client = Client::new(120);
    let forger = Client::new(130);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    // client's idk, forger's signature.
    let server = first_server(&n0);
    let client_encoded = client.client_block("ident", &[], None);
    let mut signed = client_encoded.clone().into_bytes();
    signed.extend_from_slice(server.as_bytes());
    let mut form = form_urlencoded::Serializer::new(String::new());
    form.append_pair("client", &client_encoded);
    form.append_pair("server", &server);
    form.append_pair("ids", &sqrl64_encode(&forger.site.sign(&signed).to_bytes()));
    let (forged_response, _) = hop(&engine, &n0, form.finish().into_bytes(), CLIENT_IP).await;
    assert_eq!(forged_response.tif, tif(&[Tif::CLIENT_FAILURE]));

    // The nut survived the forged attempt.
    let body = envelope(&client, "query", &[], &server, None, None);
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::IP_MATCHED]));
}

#[tokio::test]
async fn unknown_commands_are_not_supported() {
    let Harness { engine, .. } = harness();
    let client = Client::new(140);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&client, "frobnicate", &[], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::IP_MATCHED, Tif::FUNCTION_NOT_SUPPORTED]));
}

#[tokio::test]
async fn missing_nut_parameter_is_a_client_failure() {
    let Harness { engine, .. } = harness();
    let encoded = engine.cli(None, b"", CLIENT_IP).await;
    let response = CliResponse::decode(&encoded).unwrap();
    assert_eq!(response.tif, tif(&[Tif::CLIENT_FAILURE]));
    assert!(response.nut.is_empty());
}

#[tokio::test]
async fn known_identity_suk_is_echoed_on_request() {
    let Harness { engine, identities } = harness();
    let client = Client::new(150);
    identities.save_identity(&client.identity()).await.unwrap();

    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();
    let body = envelope(&client, "query", &["suk"], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert_eq!(response.tif, tif(&[Tif::ID_MATCH, Tif::IP_MATCHED]));
    assert_eq!(response.suk.as_deref(), Some(client.suk().as_str()));
}

#[tokio::test]
async fn pag_poll_with_the_wrong_original_nut_is_rejected() {
    let Harness { engine, .. } = harness();
    let client = Client::new(160);
    let session = engine.new_session(CLIENT_IP).await.unwrap();
    let n0 = session.original_nut.clone();

    let body = envelope(&client, "ident", &[], &first_server(&n0), None, None);
    let (response, _) = hop(&engine, &n0, body, CLIENT_IP).await;
    assert!(response.tif.contains(Tif::ID_MATCH));

    assert!(matches!(
        engine.resolve_pag(&Nut::from("someone-elses-nut"), &session.pag_nut).await,
        Err(PagError::WrongOriginalNut)
    ));
    // The failed poll consumed the entry.
    assert!(matches!(
        engine.resolve_pag(&n0, &session.pag_nut).await,
        Err(PagError::UnknownNut)
    ));
}
