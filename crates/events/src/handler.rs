/// Execute an aggregate command deterministically (no IO).
///
/// 1. **Decide**: `aggregate.handle(command)` produces events without mutating.
/// 2. **Evolve**: each event is applied via `aggregate.apply(event)`.
///
/// Useful in tests and anywhere persistence is not involved. The infra
/// dispatcher runs the same two steps around a load/append.
pub fn execute<A>(
    aggregate: &mut A,
    command: &A::Command,
) -> Result<Vec<A::Event>, A::Error>
where
    A: campusres_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
