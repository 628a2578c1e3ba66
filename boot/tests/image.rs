//! End-to-end boot_go scenarios driven entirely from in-memory generated
//! images (no external fixtures): a revert after a failed-validation swap,
//! and anti-rollback refusal of a downgraded security counter.

use boot::{BootController, BootPolicy, Error, NullListener, SlotInfo, TrailerLayout, ValidatePolicy};
use crypto::SoftwareCrypto;
use nvcounter::FlashCounterStore;
use simflash::{gen::GenBuilder, styles, SimFlash};

fn crypto_for(sk: &p256::ecdsa::SigningKey) -> SoftwareCrypto {
    let vk = p256::ecdsa::VerifyingKey::from(sk);
    SoftwareCrypto::new([0x22u8; 32], vk.to_sec1_bytes().as_ref()).unwrap()
}

fn fresh_triplet() -> (SimFlash, SimFlash, SimFlash) {
    (
        styles::K64_MAIN.build().unwrap(),
        styles::K64_MAIN.build().unwrap(),
        styles::K64_MAIN.build().unwrap(),
    )
}

/// A candidate swapped in from the secondary slot that fails signature
/// validation gets reverted: `boot_go` returns an error, and the primary
/// slot ends up holding the original, still-valid image rather than the
/// tampered one.
#[test]
fn reverts_and_restores_primary_when_candidate_fails_validation() {
    let (mut primary, mut secondary, mut scratch) = fresh_triplet();

    let (old, sk) = GenBuilder::default().size(2048).seed(1).version(0, 1, 0, 0).build_signed().unwrap();
    let (mut new, _) = GenBuilder::default().size(2048).seed(2).version(0, 2, 0, 0).build_signed().unwrap();
    // Flip a body byte after signing so the candidate's hash no longer
    // matches its stored TLV digest.
    new.data[300] ^= 0xff;

    primary.install(&old.data, 0).unwrap();
    secondary.install(&new.data, 0).unwrap();

    let secondary_slot = SlotInfo::from_flash(&secondary);
    let secondary_layout = TrailerLayout::new(&secondary_slot).unwrap();
    secondary_layout.write_magic(&mut secondary).unwrap();

    let crypto = crypto_for(&sk);
    let counters = FlashCounterStore::new(styles::K64_MAIN.build().unwrap());

    let mut controller = BootController {
        primary: &mut primary,
        secondary: &mut secondary,
        scratch: &mut scratch,
        crypto,
        counters,
        policy: BootPolicy::default(),
    };

    let mut listener = NullListener;
    let err = controller.boot_go(&mut listener, None, None).unwrap_err();
    assert_eq!(err, Error::BadImage);

    // The revert swap should have put the original image back in primary.
    let image = boot::Image::from_flash(controller.primary).unwrap();
    image
        .validate(controller.primary, &controller.crypto, ValidatePolicy::Full)
        .unwrap();
    assert_eq!(image.header.version.minor, 1);
}

/// An upgrade candidate whose security counter is behind the one already
/// recorded for this device is refused, even though it validates cleanly.
#[test]
fn rollback_refused_for_a_lower_security_counter() {
    let (mut primary, mut secondary, mut scratch) = fresh_triplet();

    let (old, sk) = GenBuilder::default()
        .size(2048)
        .seed(1)
        .version(0, 1, 0, 0)
        .security_counter(5)
        .build_signed()
        .unwrap();
    primary.install(&old.data, 0).unwrap();

    let crypto = crypto_for(&sk);
    let counters = FlashCounterStore::new(styles::K64_MAIN.build().unwrap());

    let mut controller = BootController {
        primary: &mut primary,
        secondary: &mut secondary,
        scratch: &mut scratch,
        crypto,
        counters,
        policy: BootPolicy::default(),
    };

    let mut listener = NullListener;
    // First boot records the counter from the image already in primary.
    controller.boot_go(&mut listener, None, None).unwrap();

    let (older, _) = GenBuilder::default()
        .size(2048)
        .seed(2)
        .version(0, 2, 0, 0)
        .security_counter(3)
        .build_signed()
        .unwrap();
    controller.secondary.install(&older.data, 0).unwrap();
    let secondary_slot = SlotInfo::from_flash(controller.secondary);
    let secondary_layout = TrailerLayout::new(&secondary_slot).unwrap();
    secondary_layout.write_magic(controller.secondary).unwrap();

    let err = controller.boot_go(&mut listener, None, None).unwrap_err();
    assert_eq!(err, Error::RollbackRefused);

    // The refused candidate must not be left resident in primary: the swap
    // that brought it in gets undone before the error is returned.
    let image = boot::Image::from_flash(controller.primary).unwrap();
    assert_eq!(image.header.version.minor, 1);
}

/// A primary slot left in the `Test`-swapped-but-unconfirmed state from a
/// prior boot (magic good, copy_done set, image_ok unset) with no new
/// secondary activity must revert on the next boot, restoring the original
/// image that was swapped out.
#[test]
fn reverts_unconfirmed_test_swap_on_next_boot_with_no_new_upgrade() {
    let (mut primary, mut secondary, mut scratch) = fresh_triplet();

    let (old, sk) = GenBuilder::default().size(2048).seed(1).version(0, 1, 0, 0).build_signed().unwrap();
    let (new, _) = GenBuilder::default().size(2048).seed(2).version(0, 2, 0, 0).build_signed().unwrap();
    primary.install(&old.data, 0).unwrap();
    secondary.install(&new.data, 0).unwrap();

    let secondary_slot = SlotInfo::from_flash(&secondary);
    let secondary_layout = TrailerLayout::new(&secondary_slot).unwrap();
    secondary_layout.write_magic(&mut secondary).unwrap();

    let crypto = crypto_for(&sk);
    let counters = FlashCounterStore::new(styles::K64_MAIN.build().unwrap());

    let mut controller = BootController {
        primary: &mut primary,
        secondary: &mut secondary,
        scratch: &mut scratch,
        crypto,
        counters,
        policy: BootPolicy::default(),
    };

    let mut listener = NullListener;
    // First boot performs the upgrade swap and leaves image_ok unset (a
    // "Test" swap that nothing has confirmed yet).
    let resp = controller.boot_go(&mut listener, None, None).unwrap();
    assert_eq!(resp.header.version.minor, 2);

    // Second boot, with no new pending secondary: the unconfirmed swap from
    // the first boot must revert, restoring the original primary image.
    let resp = controller.boot_go(&mut listener, None, None).unwrap();
    assert_eq!(resp.header.version.minor, 1);

    // The restored image is confirmed (image_ok set) so the device doesn't
    // re-revert itself back out on the very next boot.
    let primary_slot = SlotInfo::from_flash(controller.primary);
    let primary_layout = TrailerLayout::new(&primary_slot).unwrap();
    assert_eq!(
        primary_layout.read_image_ok(controller.primary).unwrap(),
        boot::Flag::Set
    );
}
