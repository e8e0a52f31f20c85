use anyhow::Result;

use super::common::{run, with_python};

#[test]
fn time_limit_interrupts_script() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            import time

            ctx = Context()
            ctx.set_time_limit(0.05)
            start = time.monotonic()
            err = raises(JSException, ctx.eval, "while (true) {}", match="interrupted")
            assert time.monotonic() - start < 5
            assert not isinstance(err, StackOverflow)

            # The limit applies per call, not per runtime lifetime.
            assert ctx.eval("let n = 0; for (let i = 0; i < 1000; i++) n += i; n") == 499500

            ctx.set_time_limit(-1)
            assert ctx.eval("1 + 1") == 2
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn time_limit_from_constructor_and_json() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context(time_limit=0.05)
            raises(JSException, ctx.eval, "for (;;) {}", match="interrupted")

            ctx = Context()
            ctx.configure_json('{"time_limit": 0.05}')
            spin = ctx.eval("(function() { for (;;) {} })")
            raises(JSException, spin, match="interrupted")
            ctx.configure_json('{"time_limit": -1}')
            assert ctx.eval("2") == 2

            raises(ValueError, ctx.configure_json, '{"memory": 1}', match="Invalid configuration")
            raises(ValueError, ctx.configure_json, "not json")
            raises(TypeError, Context, 1)
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn memory_limit_fails_allocations() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.set_memory_limit(4 * 1024 * 1024)
            raises(JSException, ctx.eval, "'x'.repeat(64 * 1024 * 1024)")
            assert ctx.eval("'x'.repeat(16)") == "x" * 16

            ctx = Context(memory_limit=4 * 1024 * 1024)
            raises(JSException, ctx.eval, "new ArrayBuffer(64 * 1024 * 1024)")

            ctx = Context()
            ctx.configure_json('{"memory_limit": 4194304}')
            assert ctx.memory()["malloc_limit"] == 4194304
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn stack_limit_raises_stack_overflow() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.eval("""
                function depth(v) {
                    return v <= 0 ? 0 : 1 + depth(v - 1);
                }
            """)
            depth = ctx.get("depth")
            assert depth(100) == 100

            err = raises(StackOverflow, depth, 1000000)
            assert isinstance(err, JSException)

            ctx.set_max_stack_size(64 * 1024)
            raises(StackOverflow, depth, 5000)
            ctx.set_max_stack_size(8 * 1024 * 1024)
            assert depth(500) == 500

            small = Context(max_stack_size=64 * 1024)
            raises(StackOverflow, small.eval, "(function f(v) { return v <= 0 ? 0 : 1 + f(v - 1); })(100000)")
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn memory_statistics_and_gc() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            stats = ctx.memory()
            for key in ("memory_used_size", "malloc_size", "obj_count", "atom_count"):
                assert key in stats, key
                assert isinstance(stats[key], int)
            assert stats["memory_used_size"] > 0

            ctx.gc()
            used = ctx.memory()["memory_used_size"]
            ctx.eval("big = new Array(100000).fill(1)")
            assert ctx.memory()["memory_used_size"] >= used
            ctx.eval("big = null")

            ctx.gc()
            before = ctx.memory()["obj_count"]
            ctx.eval("""
                keep = [];
                for (let i = 0; i < 100; i++) {
                    let a = {};
                    let b = {};
                    a.b = b;
                    b.a = a;
                    keep.push(a);
                }
            """)
            assert ctx.memory()["obj_count"] >= before + 200
            ctx.eval("keep = null")
            ctx.gc()
            assert ctx.memory()["obj_count"] <= before + 1
            "#,
        )?;
        Ok(())
    })
}
