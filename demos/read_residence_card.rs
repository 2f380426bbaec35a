use std::env;

use tracing::{error, info, warn};
use zairyu::{bytes2hex, read_card, ReaderConfig, ZairyuError};

fn main() -> Result<(), ZairyuError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let Some(reader) = readers.next() else {
        error!("No readers are connected.");
        std::process::exit(1);
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let card_number = env::var("CARDNO").expect("Please set CARDNO environment variable");

    let card_data = match read_card(card, &card_number, ReaderConfig::default()) {
        Ok(card_data) => card_data,
        Err(ZairyuError::IncorrectCredential { retries_remaining }) => {
            error!("The card number was rejected, {retries_remaining} retries remaining.");
            std::process::exit(1);
        }
        Err(err) => return Err(err),
    };

    info!("Card type: {}", card_data.card_type());
    info!("Common data: {}", bytes2hex(card_data.common_data()));

    let address = card_data.address_record()?;
    info!(
        "Address ({}, {}): {}",
        address.date,
        address.municipality_code,
        address.address_text().unwrap_or("<not UTF-8>")
    );

    if let Some(additional_data) = card_data.additional_data() {
        info!(
            "Comprehensive permission: {:?}",
            additional_data.comprehensive_permission_text()
        );
        info!(
            "Individual permission: {:?}",
            additional_data.individual_permission_text()
        );
        info!(
            "Extension application: {:?}",
            additional_data.extension_application_text()
        );
    }

    match card_data.verification_result() {
        Some(result) if result.is_valid => info!("Check code is valid"),
        Some(result) => warn!("Check code is invalid: {:?}", result.error),
        None => info!("Check code was not verified"),
    }

    if let Some(front_image) = card_data.front_image_value() {
        std::fs::write("front.bin", front_image).expect("Error writing file");
    }
    if let Some(face_image) = card_data.face_image_value() {
        std::fs::write("face.bin", face_image).expect("Error writing file");
    }

    Ok(())
}
