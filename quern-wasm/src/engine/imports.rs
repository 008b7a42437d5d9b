//! Host import definitions.
//!
//! Installs every callback from the ABI table under module `"env"`: typed
//! tracing prints, `insist`/`throw` diagnostics, the allocator report,
//! `read_result_set`, and the full (kind × key type) matrix of index
//! callbacks. Callbacks recover per-query state through the context
//! registry using the module id carried in the store data.

use wasmtime::{Caller, Linker};

use crate::abi::{host_imports, index_import_name, IndexOp, KeyType, IMPORT_MODULE};
use crate::context::registry;
use crate::error::{BackendError, ExceptionKind};
use crate::index::{self, BoundOp, HostKey, IndexKind};

use super::QueryHost;

pub(crate) fn define_imports(linker: &mut Linker<QueryHost>) -> anyhow::Result<()> {
    // --- Tracing ---
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_I32,
        |_: Caller<'_, QueryHost>, v: i32| println!("{v}"),
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_I64,
        |_: Caller<'_, QueryHost>, v: i64| println!("{v}"),
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_F32,
        |_: Caller<'_, QueryHost>, v: f32| println!("{v}"),
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_F64,
        |_: Caller<'_, QueryHost>, v: f64| println!("{v}"),
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_STR,
        |caller: Caller<'_, QueryHost>, offset: u32| -> anyhow::Result<()> {
            let ctx = registry::get(caller.data().context_id).map_err(anyhow::Error::new)?;
            let s = ctx.arena().read_cstr(offset).map_err(anyhow::Error::new)?;
            println!("{s}");
            Ok(())
        },
    )?;

    // --- Diagnostics ---
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::INSIST,
        |caller: Caller<'_, QueryHost>, message_id: i64| -> () {
            let location = registry::get(caller.data().context_id)
                .map(|ctx| ctx.messages().render(message_id))
                .unwrap_or_else(|_| format!("<unknown context, message id {message_id}>"));
            eprintln!("insist failed at {location}");
            std::process::abort();
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::THROW,
        |caller: Caller<'_, QueryHost>, kind: i64, message_id: i64| -> anyhow::Result<()> {
            let ctx = registry::get(caller.data().context_id).map_err(anyhow::Error::new)?;
            let (file, line, msg) = ctx
                .messages()
                .get(message_id)
                .map(|(file, line, msg)| (file.to_string(), line, msg.to_string()))
                .unwrap_or_else(|| ("<unknown>".to_string(), 0, String::new()));
            Err(anyhow::Error::new(BackendError::Guest {
                kind: ExceptionKind::from_raw(kind),
                file,
                line,
                msg,
            }))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::PRINT_MEMORY_CONSUMPTION,
        |_: Caller<'_, QueryHost>, total: u32, peak: u32| {
            let mib = |bytes: u32| bytes as f64 / (1024.0 * 1024.0);
            println!(
                "memory consumption: {:.2} MiB total, {:.2} MiB peak",
                mib(total),
                mib(peak)
            );
        },
    )?;

    // --- Results ---
    linker.func_wrap(
        IMPORT_MODULE,
        host_imports::READ_RESULT_SET,
        |caller: Caller<'_, QueryHost>, offset: u32, count: u32| -> anyhow::Result<()> {
            let ctx = registry::get(caller.data().context_id).map_err(anyhow::Error::new)?;
            crate::result::read_result_set(&ctx, offset, count).map_err(anyhow::Error::new)
        },
    )?;

    // --- Indexes ---
    define_index_imports(linker)?;

    Ok(())
}

/// Stamps out `idx_{lower_bound,upper_bound,scan}_{array,rmi}_{…}` for every
/// key type.
fn define_index_imports(linker: &mut Linker<QueryHost>) -> anyhow::Result<()> {
    for kind in [IndexKind::Array, IndexKind::RecursiveModel] {
        macro_rules! bounds {
            ($key:expr, $ty:ty, $decode:expr) => {
                for (op_name, op) in [
                    (IndexOp::LowerBound, BoundOp::Lower),
                    (IndexOp::UpperBound, BoundOp::Upper),
                ] {
                    let name = index_import_name(op_name, kind, $key);
                    linker.func_wrap(
                        IMPORT_MODULE,
                        &name,
                        move |caller: Caller<'_, QueryHost>,
                              idx: u64,
                              key: $ty|
                              -> anyhow::Result<u32> {
                            let ctx = registry::get(caller.data().context_id)
                                .map_err(anyhow::Error::new)?;
                            let key = $decode(&ctx, key).map_err(anyhow::Error::new)?;
                            index::bound_lookup(&ctx, kind, idx, key, op)
                                .map_err(anyhow::Error::new)
                        },
                    )?;
                }
            };
        }
        bounds!(KeyType::B, i32, |_ctx: &_, v: i32| Ok::<_, BackendError>(
            HostKey::Bool(v != 0)
        ));
        bounds!(KeyType::I1, i32, |_ctx: &_, v: i32| Ok::<_, BackendError>(
            HostKey::I8(v as i8)
        ));
        bounds!(KeyType::I2, i32, |_ctx: &_, v: i32| Ok::<_, BackendError>(
            HostKey::I16(v as i16)
        ));
        bounds!(KeyType::I4, i32, |_ctx: &_, v: i32| Ok::<_, BackendError>(
            HostKey::I32(v)
        ));
        bounds!(KeyType::I8, i64, |_ctx: &_, v: i64| Ok::<_, BackendError>(
            HostKey::I64(v)
        ));
        bounds!(KeyType::F, f32, |_ctx: &_, v: f32| Ok::<_, BackendError>(
            HostKey::F32(v)
        ));
        bounds!(KeyType::D, f64, |_ctx: &_, v: f64| Ok::<_, BackendError>(
            HostKey::F64(v)
        ));
        // String keys arrive as arena offsets to NUL-terminated bytes.
        bounds!(
            KeyType::P,
            u32,
            |ctx: &std::sync::Arc<crate::context::WasmContext>, offset: u32| {
                ctx.arena().read_cstr_bytes(offset).map(HostKey::Str)
            }
        );

        for key in KeyType::ALL {
            let name = index_import_name(IndexOp::Scan, kind, key);
            linker.func_wrap(
                IMPORT_MODULE,
                &name,
                move |caller: Caller<'_, QueryHost>,
                      idx: u64,
                      entry: u32,
                      out: u32,
                      batch: u32|
                      -> anyhow::Result<()> {
                    let ctx =
                        registry::get(caller.data().context_id).map_err(anyhow::Error::new)?;
                    index::scan_into(&ctx, kind, key, idx, entry, out, batch)
                        .map_err(anyhow::Error::new)
                },
            )?;
        }
    }
    Ok(())
}
