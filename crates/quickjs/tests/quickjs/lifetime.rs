use anyhow::Result;

use super::common::{run, with_python};

#[test]
fn objects_keep_their_runtime_alive() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            def make():
                ctx = Context()
                return ctx.eval("(function(x) { return x + 1; })")

            f = make()
            gc.collect()
            assert f(1) == 2

            def make_weak():
                ctx = Context()
                return ctx.eval("({})"), weakref.ref(ctx)

            obj, ref = make_weak()
            gc.collect()
            assert ref() is not None
            del obj
            gc.collect()
            assert ref() is None
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn runtime_is_dropped_without_references() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ref = weakref.ref(ctx)
            del ctx
            assert ref() is None
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn callable_cycles_are_collected() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            def reentrant_cycle():
                ctx = Context()
                ctx.add_callable("reenter", lambda: ctx.eval("1"))
                assert ctx.eval("reenter()") == 1
                return weakref.ref(ctx)

            def object_cycle():
                ctx = Context()
                obj = ctx.eval("({})")
                ctx.add_callable("hold", lambda: obj)
                assert isinstance(ctx.eval("hold()"), Object)
                return weakref.ref(ctx)

            refs = [reentrant_cycle(), object_cycle()]
            gc.collect()
            assert all(ref() is None for ref in refs)
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn finalized_functions_release_their_callable() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            class Callback:
                def __call__(self):
                    return 1

            ctx = Context()
            cb = Callback()
            ref = weakref.ref(cb)
            ctx.add_callable("cb", cb)
            del cb
            gc.collect()
            assert ref() is not None
            assert ctx.eval("cb()") == 1

            ctx.eval("delete globalThis.cb")
            ctx.gc()
            assert ref() is None
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn independent_runtimes_run_in_parallel_threads() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            results = {}
            errors = []

            def work(index):
                try:
                    ctx = Context(time_limit=5)
                    total = ctx.eval("let s = 0; for (let i = 0; i < 200000; i++) s += i; s")
                    results[index] = total
                except Exception as err:
                    errors.append(err)

            threads = [threading.Thread(target=work, args=(i,)) for i in range(4)]
            for thread in threads:
                thread.start()
            for thread in threads:
                thread.join()
            assert not errors, errors
            assert results == {i: 19999900000 for i in range(4)}, results
            "#,
        )?;
        Ok(())
    })
}

#[test]
fn shared_runtime_is_serialized_across_threads() -> Result<()> {
    with_python(|py| {
        run(
            py,
            r#"
            ctx = Context()
            ctx.eval("counter = 0")
            ctx.add_callable("bump", lambda: 1)
            errors = []

            def work():
                try:
                    for _ in range(200):
                        ctx.eval("counter += bump()")
                        assert isinstance(ctx.eval("({})"), Object)
                except Exception as err:
                    errors.append(err)

            threads = [threading.Thread(target=work) for _ in range(4)]
            for thread in threads:
                thread.start()
            for thread in threads:
                thread.join()
            assert not errors, errors
            assert ctx.eval("counter") == 800
            "#,
        )?;
        Ok(())
    })
}
