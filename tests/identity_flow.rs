//! End-to-end identity flows against the in-memory store with a manual
//! clock: signup fan-out, challenge issue/verify, lockout behavior,
//! identifier-change lifecycle and multi-identifier login.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};

use anyid::{
    ChallengePurpose, Clock, ContactKind, Error, IdentityConfig, IdentityService, IdentityStore,
    ManualClock, MemoryStore, NewUser, OtpConfig, PasswordHasher, SecretDelivery, StoreError,
    TransmissionError,
};

/// Delivery double that records every send.
#[derive(Debug, Default)]
struct CapturingDelivery {
    sent: Mutex<Vec<(ContactKind, String, String)>>,
    fail: bool,
}

impl CapturingDelivery {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn last_secret(&self) -> Option<String> {
        self.sent
            .lock()
            .expect("delivery lock")
            .last()
            .map(|(_, _, secret)| secret.clone())
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().expect("delivery lock").len()
    }
}

#[async_trait]
impl SecretDelivery for CapturingDelivery {
    async fn send(
        &self,
        kind: ContactKind,
        destination: &str,
        secret: &str,
    ) -> Result<(), TransmissionError> {
        self.sent.lock().expect("delivery lock").push((
            kind,
            destination.to_string(),
            secret.to_string(),
        ));
        if self.fail {
            return Err(TransmissionError::new(destination, "relay unavailable"));
        }
        Ok(())
    }
}

/// Cheap reversible hasher so the flow tests stay fast; the real Argon2id
/// implementation has its own unit tests.
#[derive(Debug, Default)]
struct PlainHasher;

impl PasswordHasher for PlainHasher {
    fn hash(&self, password: &SecretString) -> Result<String, Error> {
        Ok(format!("plain:{}", password.expose_secret()))
    }

    fn verify(&self, password: &SecretString, stored: &str) -> bool {
        stored == format!("plain:{}", password.expose_secret())
    }

    fn set_unusable(&self) -> String {
        "!unusable".to_string()
    }
}

struct Harness {
    service: IdentityService,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    delivery: Arc<CapturingDelivery>,
}

fn start_time() -> DateTime<Utc> {
    "2026-03-01T00:00:00Z".parse().expect("fixed timestamp")
}

fn harness() -> Result<Harness> {
    harness_with(IdentityConfig::default(), CapturingDelivery::default())
}

fn harness_with(config: IdentityConfig, delivery: CapturingDelivery) -> Result<Harness> {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let delivery = Arc::new(delivery);
    let service = IdentityService::new(
        store.clone(),
        Arc::new(PlainHasher),
        delivery.clone(),
        clock.clone(),
        config,
    )?;
    Ok(Harness {
        service,
        store,
        clock,
        delivery,
    })
}

fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}

fn full_signup() -> NewUser {
    NewUser {
        username: Some("Alice".to_string()),
        email: Some("Alice@EXAMPLE.com".to_string()),
        phone: Some("+1 (202) 555-1234".to_string()),
        password: Some(secret("correct horse")),
    }
}

#[tokio::test]
async fn signup_normalizes_and_fans_out_setup_credentials() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    assert_eq!(user.username.as_deref(), Some("Alice"));
    assert_eq!(user.username_folded.as_deref(), Some("alice"));
    assert_eq!(user.email.as_deref(), Some("Alice@example.com"));
    assert_eq!(user.phone.as_deref(), Some("+12025551234"));

    for kind in ContactKind::ALL {
        let credential = h
            .store
            .fetch_credential(user.id, kind, ChallengePurpose::Setup)
            .await?;
        assert_eq!(Some(credential.bound_value.as_str()), user.contact(kind));
        assert!(!credential.otp.is_confirmed());
        assert_eq!(credential.otp.secret(), None);
    }
    Ok(())
}

#[tokio::test]
async fn signup_with_idn_email_stores_the_encoded_domain() -> Result<()> {
    let h = harness()?;
    let user = h
        .service
        .signup(NewUser {
            email: Some("validEmail@bücher.example".to_string()),
            ..NewUser::default()
        })
        .await?;
    assert_eq!(
        user.email.as_deref(),
        Some("validEmail@xn--bcher-kva.example")
    );
    Ok(())
}

#[tokio::test]
async fn signup_rejects_duplicates_with_a_field_error() -> Result<()> {
    let h = harness()?;
    h.service.signup(full_signup()).await?;

    let err = h
        .service
        .signup(NewUser {
            username: Some("ALICE".to_string()),
            password: Some(secret("other")),
            ..NewUser::default()
        })
        .await
        .unwrap_err();
    let Error::Validation(map) = err else {
        panic!("expected validation error");
    };
    assert_eq!(map.get("username"), Some(&["already taken".to_string()][..]));
    Ok(())
}

#[tokio::test]
async fn challenge_round_trip_confirms_the_channel() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    assert!(!h.service.contact_is_verified(user.id, ContactKind::Email).await?);

    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let sent = h.delivery.last_secret().expect("secret delivered");

    let passed = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &sent)
        .await?;
    assert!(passed);
    assert!(h.service.contact_is_verified(user.id, ContactKind::Email).await?);

    let credential = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    assert_eq!(credential.otp.secret(), None);
    assert_eq!(credential.otp.throttle().failure_count(), 0);
    Ok(())
}

#[tokio::test]
async fn lockout_rejects_the_correct_secret_until_the_window_elapses() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let sent = h.delivery.last_secret().expect("secret delivered");

    let passed = h
        .service
        .verify_challenge(
            user.id,
            ContactKind::Email,
            ChallengePurpose::Setup,
            "WRONGONE",
        )
        .await?;
    assert!(!passed);

    // Inside the 1s window even the correct secret is rejected.
    let err = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &sent)
        .await
        .unwrap_err();
    match err {
        Error::Timeout {
            locked_until,
            failure_count,
        } => {
            assert_eq!(failure_count, 1);
            assert_eq!(locked_until, h.clock.now() + Duration::seconds(1));
        }
        other => panic!("expected timeout, got {other}"),
    }

    h.clock.advance(Duration::seconds(1));
    let passed = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &sent)
        .await?;
    assert!(passed);
    Ok(())
}

#[tokio::test]
async fn consecutive_failures_double_the_window() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;

    for (failures, window) in [(1u32, 1i64), (2, 2), (3, 4), (4, 8)] {
        let passed = h
            .service
            .verify_challenge(
                user.id,
                ContactKind::Email,
                ChallengePurpose::Setup,
                "WRONGONE",
            )
            .await?;
        assert!(!passed);

        let credential = h
            .store
            .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
            .await?;
        assert_eq!(credential.otp.throttle().failure_count(), failures);
        assert_eq!(
            credential.otp.throttle().locked_until(),
            Some(h.clock.now() + Duration::seconds(window))
        );
        h.clock.advance(Duration::seconds(window));
    }
    Ok(())
}

#[tokio::test]
async fn empty_submission_never_touches_the_throttle() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;

    let err = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument("secret")));

    let credential = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    assert_eq!(credential.otp.throttle().failure_count(), 0);
    assert!(credential.otp.secret().is_some());
    Ok(())
}

#[tokio::test]
async fn expired_secret_counts_as_a_plain_failure() -> Result<()> {
    let config = IdentityConfig::new()
        .with_setup_otp(OtpConfig::new().with_ttl(Duration::minutes(5)));
    let h = harness_with(config, CapturingDelivery::default())?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let sent = h.delivery.last_secret().expect("secret delivered");

    h.clock.advance(Duration::minutes(5));
    let passed = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &sent)
        .await?;
    assert!(!passed);

    let credential = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    assert_eq!(credential.otp.throttle().failure_count(), 1);
    assert!(!credential.otp.is_confirmed());
    Ok(())
}

#[tokio::test]
async fn changing_an_email_rebinds_the_credential_in_place() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let old_secret = h.delivery.last_secret().expect("secret delivered");
    let before = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;

    let updated = h
        .service
        .set_email(user.id, Some("newbox@example.com"))
        .await?;
    assert_eq!(updated.email.as_deref(), Some("newbox@example.com"));

    let after = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    assert_eq!(after.id, before.id, "row identity must survive the rebind");
    assert_eq!(after.bound_value, "newbox@example.com");
    assert!(!after.otp.is_confirmed());
    assert_eq!(after.otp.secret(), None);

    // The secret issued for the old address no longer verifies.
    let passed = h
        .service
        .verify_challenge(
            user.id,
            ContactKind::Email,
            ChallengePurpose::Setup,
            &old_secret,
        )
        .await?;
    assert!(!passed);
    Ok(())
}

#[tokio::test]
async fn confirmation_does_not_survive_an_address_change() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let sent = h.delivery.last_secret().expect("secret delivered");
    assert!(
        h.service
            .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &sent)
            .await?
    );
    assert!(h.service.contact_is_verified(user.id, ContactKind::Email).await?);

    h.service
        .set_email(user.id, Some("newbox@example.com"))
        .await?;
    assert!(!h.service.contact_is_verified(user.id, ContactKind::Email).await?);
    Ok(())
}

#[tokio::test]
async fn clearing_an_email_deletes_its_credentials() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    h.service.set_email(user.id, None).await?;

    let err = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CredentialNotFound));

    let err = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, "ABCD")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound("credential")));
    Ok(())
}

#[tokio::test]
async fn the_last_identifier_cannot_be_cleared() -> Result<()> {
    let h = harness()?;
    let user = h
        .service
        .signup(NewUser {
            email: Some("only@example.com".to_string()),
            ..NewUser::default()
        })
        .await?;

    let err = h.service.set_email(user.id, None).await.unwrap_err();
    let Error::Validation(map) = err else {
        panic!("expected validation error");
    };
    assert!(map.get("identifier").is_some());

    // Still addressable afterwards.
    assert!(h
        .service
        .find_by_identifier("only@example.com")
        .await?
        .is_some());
    Ok(())
}

#[tokio::test]
async fn login_works_with_any_identifier_shape() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    // Username lookup is case-insensitive.
    let by_username = h.service.login("alice", &secret("correct horse")).await?;
    assert_eq!(by_username.map(|u| u.id), Some(user.id));

    // Email lookup normalizes the domain first.
    let by_email = h
        .service
        .login("Alice@EXAMPLE.com", &secret("correct horse"))
        .await?;
    assert_eq!(by_email.map(|u| u.id), Some(user.id));

    // Phone lookup tolerates formatting punctuation.
    let by_phone = h
        .service
        .login("+1 202 555 1234", &secret("correct horse"))
        .await?;
    assert_eq!(by_phone.map(|u| u.id), Some(user.id));

    // Wrong password and unknown identifier are both an opaque None.
    assert!(h.service.login("alice", &secret("wrong")).await?.is_none());
    assert!(h
        .service
        .login("nobody@example.com", &secret("correct horse"))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn passwordless_signup_cannot_log_in_with_any_password() -> Result<()> {
    let h = harness()?;
    h.service
        .signup(NewUser {
            username: Some("ghost".to_string()),
            ..NewUser::default()
        })
        .await?;

    assert!(h.service.login("ghost", &secret("")).await?.is_none());
    assert!(h.service.login("ghost", &secret("!unusable")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn login_codes_are_issued_on_demand_with_their_own_shape() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    h.service
        .issue_challenge(user.id, ContactKind::Phone, ChallengePurpose::Login)
        .await?;
    let code = h.delivery.last_secret().expect("code delivered");
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|ch| ch.is_ascii_digit()));

    let passed = h
        .service
        .verify_challenge(user.id, ContactKind::Phone, ChallengePurpose::Login, &code)
        .await?;
    assert!(passed);
    Ok(())
}

#[tokio::test]
async fn delivery_failure_surfaces_but_keeps_the_secret() -> Result<()> {
    let h = harness_with(IdentityConfig::default(), CapturingDelivery::failing())?;
    let user = h.service.signup(full_signup()).await?;

    let err = h
        .service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transmission(_)));
    assert_eq!(h.delivery.sent_count(), 1);

    // The pending state was persisted before the send was attempted, so the
    // generated secret still verifies.
    let attempted = h.delivery.last_secret().expect("send attempted");
    let passed = h
        .service
        .verify_challenge(
            user.id,
            ContactKind::Email,
            ChallengePurpose::Setup,
            &attempted,
        )
        .await?;
    assert!(passed);
    Ok(())
}

#[tokio::test]
async fn reissue_invalidates_the_previous_secret() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let first = h.delivery.last_secret().expect("first secret");
    h.service
        .issue_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await?;
    let second = h.delivery.last_secret().expect("second secret");

    if first != second {
        let passed = h
            .service
            .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &first)
            .await?;
        assert!(!passed);
        // Sit out the lockout the failed attempt started.
        h.clock.advance(Duration::seconds(1));
    }
    let passed = h
        .service
        .verify_challenge(user.id, ContactKind::Email, ChallengePurpose::Setup, &second)
        .await?;
    assert!(passed);
    Ok(())
}

#[tokio::test]
async fn deleting_a_user_cascades_to_credentials() -> Result<()> {
    let h = harness()?;
    let user = h.service.signup(full_signup()).await?;

    h.service.delete_user(user.id).await?;

    let err = h.service.user(user.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound("user")));
    let err = h
        .store
        .fetch_credential(user.id, ContactKind::Email, ChallengePurpose::Setup)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CredentialNotFound));
    Ok(())
}

#[tokio::test]
async fn setting_a_phone_after_signup_creates_its_credential() -> Result<()> {
    let h = harness()?;
    let user = h
        .service
        .signup(NewUser {
            username: Some("bob".to_string()),
            ..NewUser::default()
        })
        .await?;

    let err = h
        .store
        .fetch_credential(user.id, ContactKind::Phone, ChallengePurpose::Setup)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CredentialNotFound));

    let updated = h.service.set_phone(user.id, Some("+12025550100")).await?;
    assert_eq!(updated.phone.as_deref(), Some("+12025550100"));

    let credential = h
        .store
        .fetch_credential(user.id, ContactKind::Phone, ChallengePurpose::Setup)
        .await?;
    assert_eq!(credential.bound_value, "+12025550100");
    assert!(!credential.otp.is_confirmed());
    Ok(())
}
