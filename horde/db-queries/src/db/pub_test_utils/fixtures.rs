// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entities created through the store, for tests that need something to
//! work on

use super::TestDatabase;
use crate::db::datastore::ApnStore;
use crate::db::datastore::CollectionStore;
use crate::db::datastore::DeviceStore;
use crate::db::datastore::FirmwareStore;
use crate::db::datastore::InviteStore;
use crate::db::datastore::TeamStore;
use crate::db::datastore::TokenStore;
use crate::db::datastore::UserStore;
use horde_common::key::Key;
use horde_common::key::KeyKind;
use horde_db_model::now;
use horde_db_model::Apn;
use horde_db_model::AuthType;
use horde_db_model::Collection;
use horde_db_model::CollectionFirmware;
use horde_db_model::Device;
use horde_db_model::FieldMask;
use horde_db_model::Firmware;
use horde_db_model::FirmwareMetadata;
use horde_db_model::Invite;
use horde_db_model::Nas;
use horde_db_model::NetworkMetadata;
use horde_db_model::Tags;
use horde_db_model::Team;
use horde_db_model::Token;
use horde_db_model::User;

/// A user and its private team, not yet stored.
pub async fn user_models(db: &TestDatabase, external_id: &str) -> (User, Team) {
    let user_id = db.new_id(KeyKind::User).await;
    let team_id = db.new_id(KeyKind::Team).await;
    let user = User {
        user_id,
        external_id: external_id.to_owned(),
        auth_type: AuthType::GitHub,
        name: format!("User {}", external_id),
        email: format!("{}@example.com", external_id),
        phone: String::new(),
        avatar_url: String::new(),
        verified_email: false,
        verified_phone: false,
        private_team_id: team_id,
    };
    let team = Team { team_id, private: true, members: vec![], tags: Tags::new() };
    (user, team)
}

/// Creates a user signed in through GitHub, returning it and its private
/// team.
pub async fn user(db: &TestDatabase, external_id: &str) -> (User, Team) {
    let (user, team) = user_models(db, external_id).await;
    db.store().create_user(&user, &team).await.unwrap();
    let team =
        db.store().retrieve_team(user.user_id, team.team_id).await.unwrap();
    (user, team)
}

/// Creates a shared team administered by `admin_id`.
pub async fn team(db: &TestDatabase, admin_id: Key) -> Team {
    let team = Team {
        team_id: db.new_id(KeyKind::Team).await,
        private: false,
        members: vec![],
        tags: Tags::new(),
    };
    db.store().create_team(admin_id, &team).await.unwrap();
    db.store().retrieve_team(admin_id, team.team_id).await.unwrap()
}

pub async fn invite(
    db: &TestDatabase,
    admin_id: Key,
    team_id: Key,
    code: &str,
) -> Invite {
    let invite = Invite {
        code: code.to_owned(),
        team_id,
        user_id: admin_id,
        created: now(),
    };
    db.store().create_invite(&invite).await.unwrap();
    invite
}

/// Adds `user_id` to a team as a plain member, through an invite.
pub async fn join(db: &TestDatabase, admin_id: Key, team_id: Key, user_id: Key) {
    let code = format!("join-{}-{}", team_id, user_id);
    invite(db, admin_id, team_id, &code).await;
    db.store().accept_invite(user_id, &code).await.unwrap();
}

pub async fn collection(
    db: &TestDatabase,
    user_id: Key,
    team_id: Key,
) -> Collection {
    let collection = Collection {
        collection_id: db.new_id(KeyKind::Collection).await,
        team_id,
        field_mask: FieldMask::all(),
        firmware: CollectionFirmware::default(),
        tags: Tags::new(),
    };
    db.store().create_collection(user_id, &collection).await.unwrap();
    collection
}

/// A device, not yet stored.  The IMEI is derived from the IMSI.
pub async fn device_model(
    db: &TestDatabase,
    collection_id: Key,
    imsi: i64,
) -> Device {
    Device {
        device_id: db.new_id(KeyKind::Device).await,
        collection_id,
        imsi,
        imei: imsi + 350_000_000_000_000,
        network: NetworkMetadata::default(),
        firmware: FirmwareMetadata::default(),
        tags: Tags::new(),
    }
}

pub async fn device(
    db: &TestDatabase,
    user_id: Key,
    collection_id: Key,
    imsi: i64,
) -> Device {
    let device = device_model(db, collection_id, imsi).await;
    db.store().create_device(user_id, &device).await.unwrap();
    device
}

/// Firmware metadata, not yet stored.
pub async fn firmware_model(
    db: &TestDatabase,
    collection_id: Key,
    version: &str,
    sha256: &str,
) -> Firmware {
    Firmware {
        firmware_id: db.new_id(KeyKind::Firmware).await,
        collection_id,
        filename: format!("firmware-{}.bin", version),
        version: version.to_owned(),
        length: 1024,
        sha256: sha256.to_owned(),
        created: now(),
        tags: Tags::new(),
    }
}

pub async fn firmware(
    db: &TestDatabase,
    user_id: Key,
    collection_id: Key,
    version: &str,
    sha256: &str,
) -> Firmware {
    let firmware = firmware_model(db, collection_id, version, sha256).await;
    db.store().create_firmware(user_id, &firmware).await.unwrap();
    firmware
}

pub async fn token(db: &TestDatabase, user_id: Key, token: &str) -> Token {
    let token = Token {
        token: token.to_owned(),
        user_id,
        resource: String::from("/"),
        write: true,
        tags: Tags::new(),
    };
    db.store().create_token(&token).await.unwrap();
    token
}

pub async fn apn(db: &TestDatabase, apn_id: i32, name: &str) -> Apn {
    let apn = Apn { id: apn_id, name: name.to_owned() };
    db.store().create_apn(&apn).await.unwrap();
    apn
}

/// Creates a NAS identified as `nas-{nas_id}`.
pub async fn nas(
    db: &TestDatabase,
    apn_id: i32,
    nas_id: i32,
    cidr: &str,
) -> Nas {
    let nas = Nas {
        id: nas_id,
        apn_id,
        identifier: format!("nas-{}", nas_id),
        cidr: cidr.to_owned(),
    };
    db.store().create_nas(&nas).await.unwrap();
    nas
}
