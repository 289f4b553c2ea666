/// Recommended error type for your scenario `main` function and any shared code that you write for
/// hooks and scenario bodies. This type is compatible with the [crate::definition::HookResult] type
/// so you can use `?` to propagate errors.
pub type CloudBenchResult<T> = anyhow::Result<T>;
