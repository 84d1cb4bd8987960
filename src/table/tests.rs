use super::*;

fn assert_partition(table: &ConnectionTable) {
    let members = table.memberships();
    let free = members.iter().filter(|m| **m == Membership::Free).count();
    let used = members.iter().filter(|m| **m == Membership::Used).count();
    let pending = members
        .iter()
        .filter(|m| **m == Membership::PendingRemoval)
        .count();
    assert_eq!(free, table.len_free());
    assert_eq!(used, table.len_used());
    assert_eq!(pending, table.len_pending());
    assert_eq!(members.len(), table.capacity());
}

#[test]
fn acquire_until_exhausted() -> Result<()> {
    let table = ConnectionTable::new(3, 2);
    let a = table.acquire_free_entry()?;
    let b = table.acquire_free_entry()?;
    let c = table.acquire_free_entry()?;
    assert_eq!(table.acquire_free_entry(), Err(ToeError::ResourceExhausted));
    assert_eq!(table.outstanding(), 3);

    assert_eq!(table.get(a)?.channel(), 2);
    assert_eq!(table.get(b)?.channel(), 3);
    assert_eq!(table.get(c)?.channel(), 4);
    assert_eq!(table.membership(a)?, Membership::Reserved);
    assert_partition(&table);

    table.release_entry(b)?;
    assert_eq!(table.len_free(), 1);
    assert_eq!(table.outstanding(), 2);

    let d = table.acquire_free_entry()?;
    assert_eq!(d.index(), b.index());
    assert_ne!(d.generation(), b.generation());
    assert_partition(&table);
    Ok(())
}

#[test]
fn stale_handle_rejected() -> Result<()> {
    let table = ConnectionTable::new(1, 2);
    let a = table.acquire_free_entry()?;
    table.release_entry(a)?;
    let _b = table.acquire_free_entry()?;

    assert_eq!(table.get(a).err(), Some(ToeError::InvalidHandle(0)));
    Ok(())
}

#[test]
fn used_entries_cannot_be_released() -> Result<()> {
    let table = ConnectionTable::new(2, 2);
    let a = table.acquire_free_entry()?;
    table.transition(a, Membership::Reserved, Membership::Used)?;

    assert!(matches!(
        table.release_entry(a),
        Err(ToeError::InvariantViolation(_))
    ));
    assert_eq!(table.membership(a)?, Membership::Used);

    table.transition(a, Membership::Used, Membership::PendingRemoval)?;
    assert_eq!(table.len_pending(), 1);
    table.release_entry(a)?;
    assert_eq!(table.len_free(), 2);
    assert_partition(&table);
    Ok(())
}

#[test]
fn transition_checks_source() -> Result<()> {
    let table = ConnectionTable::new(2, 2);
    let a = table.acquire_free_entry()?;
    assert!(table
        .transition(a, Membership::Used, Membership::PendingRemoval)
        .is_err());
    assert_eq!(table.membership(a)?, Membership::Reserved);
    Ok(())
}

#[test]
fn active_iteration_in_insertion_order() -> Result<()> {
    let table = ConnectionTable::new(4, 2);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let h = table.acquire_free_entry()?;
        table.transition(h, Membership::Reserved, Membership::Used)?;
        handles.push(h);
    }

    let seen = table.list_active().collect::<Vec<_>>();
    assert_eq!(seen, handles);
    assert_eq!(table.first_active(), Some(handles[0]));
    Ok(())
}

#[test]
fn active_iteration_stops_when_cursor_leaves() -> Result<()> {
    let table = ConnectionTable::new(3, 2);
    let mut handles = Vec::new();
    for _ in 0..3 {
        let h = table.acquire_free_entry()?;
        table.transition(h, Membership::Reserved, Membership::Used)?;
        handles.push(h);
    }

    let mut iter = table.list_active();
    assert_eq!(iter.next(), Some(handles[0]));
    table.transition(handles[0], Membership::Used, Membership::PendingRemoval)?;
    assert_eq!(iter.next(), None);
    assert_eq!(iter.next(), None);

    // The walk sees removals of entries ahead of the cursor.
    let mut iter = table.list_active();
    assert_eq!(iter.next(), Some(handles[1]));
    table.transition(handles[2], Membership::Used, Membership::PendingRemoval)?;
    assert_eq!(iter.next(), None);

    let mut iter = table.list_active();
    assert_eq!(iter.next(), Some(handles[1]));
    Ok(())
}

#[test]
fn channel_lookup() -> Result<()> {
    let table = ConnectionTable::new(4, 2);
    let h = table.acquire_free_entry()?;
    assert_eq!(table.handle_for_channel(2), Some(h));
    assert_eq!(table.handle_for_channel(1), None);
    assert_eq!(table.handle_for_channel(6), None);
    Ok(())
}
