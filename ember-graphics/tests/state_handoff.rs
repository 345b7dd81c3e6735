//! Cross-context state tracking and barrier emission.

mod common;

use common::TestDevice;
use ember_graphics::{
    AutoBarrierScope, BarrierFlags, Device, GlobalStateManager, ResourceState, SplitBarrierBatch,
    TextureDesc, ALL_SUBRESOURCES,
};

#[test]
fn two_context_hand_off_emits_single_prelude() {
    let device = TestDevice::new();
    let global = GlobalStateManager::new();

    let texture = device
        .create_texture(
            &TextureDesc {
                width: 256,
                height: 256,
                ..Default::default()
            },
            "handoff",
        )
        .unwrap();
    global.register(texture.id(), ResourceState::COMMON, texture.subresource_count());

    // Context A: render into the texture, finalize, commit.
    let mut ctx_a = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx_a, Some(&global));
        scope.use_as_render_target(&texture, ALL_SUBRESOURCES);
        scope.finalize();
    }

    // Context B: sample it. Exactly one RT -> SRV transition, nothing else.
    let mut ctx_b = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx_b, Some(&global));
        scope.use_as_shader_resource(&texture, ALL_SUBRESOURCES);
        scope.finalize();
    }

    assert_eq!(ctx_b.transitions.len(), 1);
    let barrier = &ctx_b.transitions[0];
    assert_eq!(barrier.resource, texture.id());
    assert_eq!(barrier.subresource, ALL_SUBRESOURCES);
    assert_eq!(barrier.state_before, ResourceState::RENDER_TARGET);
    assert_eq!(barrier.state_after, ResourceState::SHADER_RESOURCE);
}

#[test]
fn repeated_requirement_is_deduplicated() {
    let device = TestDevice::new();
    let texture = device.create_texture(&TextureDesc::default(), "dedup").unwrap();

    let mut ctx = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx, None);
        scope.use_as_copy_dest(&texture);
        scope.use_as_copy_dest(&texture);
        scope.use_as_copy_dest(&texture);
        scope.finalize();
    }
    assert_eq!(ctx.transitions.len(), 1);
}

#[test]
fn per_subresource_transitions_only_touch_their_mip() {
    let device = TestDevice::new();
    let texture = device
        .create_texture(
            &TextureDesc {
                width: 64,
                height: 64,
                mip_level_count: 4,
                ..Default::default()
            },
            "mips",
        )
        .unwrap();
    let global = GlobalStateManager::new();
    global.register(
        texture.id(),
        ResourceState::SHADER_RESOURCE,
        texture.subresource_count(),
    );

    let mut ctx = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx, Some(&global));
        scope.use_as_uav(&texture, 2);
        scope.finalize();
    }
    assert_eq!(ctx.transitions.len(), 1);
    assert_eq!(ctx.transitions[0].subresource, 2);
    assert_eq!(ctx.transitions[0].state_before, ResourceState::SHADER_RESOURCE);

    // The global model now disagrees only on mip 2.
    assert_eq!(
        global.subresource_global_state(texture.id(), 2),
        Some(ResourceState::UNORDERED_ACCESS)
    );
    assert_eq!(
        global.subresource_global_state(texture.id(), 0),
        Some(ResourceState::SHADER_RESOURCE)
    );
}

#[test]
fn hand_off_from_non_uniform_global_state() {
    let device = TestDevice::new();
    let global = GlobalStateManager::new();
    let texture = device
        .create_texture(
            &TextureDesc {
                width: 64,
                height: 64,
                mip_level_count: 4,
                ..Default::default()
            },
            "non-uniform",
        )
        .unwrap();
    global.register(
        texture.id(),
        ResourceState::SHADER_RESOURCE,
        texture.subresource_count(),
    );

    // Context A leaves the mips in differing states.
    let mut ctx_a = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx_a, Some(&global));
        scope.use_as_uav(&texture, 2);
        scope.finalize();
    }

    // Context B's first sight adopts the per-mip truth, not a
    // representative: mip 2 transitions out of UAV, mip 0 out of SRV.
    let mut ctx_b = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx_b, Some(&global));
        scope.use_as_render_target(&texture, 2);
        scope.use_as_render_target(&texture, 0);
        scope.finalize();
    }

    assert_eq!(ctx_b.transitions.len(), 2);
    assert_eq!(ctx_b.transitions[0].subresource, 2);
    assert_eq!(
        ctx_b.transitions[0].state_before,
        ResourceState::UNORDERED_ACCESS
    );
    assert_eq!(ctx_b.transitions[0].state_after, ResourceState::RENDER_TARGET);
    assert_eq!(ctx_b.transitions[1].subresource, 0);
    assert_eq!(
        ctx_b.transitions[1].state_before,
        ResourceState::SHADER_RESOURCE
    );
    assert_eq!(ctx_b.transitions[1].state_after, ResourceState::RENDER_TARGET);
}

#[test]
fn split_barriers_pair_across_work() {
    let device = TestDevice::new();
    let texture = device.create_texture(&TextureDesc::default(), "split").unwrap();
    let mut ctx = device.context();

    let mut splits = SplitBarrierBatch::new();
    splits
        .begin_barrier(
            &mut ctx,
            texture.id(),
            ResourceState::RENDER_TARGET,
            ResourceState::SHADER_RESOURCE,
            ALL_SUBRESOURCES,
        )
        .unwrap();
    assert_eq!(splits.active_count(), 1);

    // Unrelated work overlaps the transition interval.
    splits.end_all(&mut ctx);
    assert_eq!(splits.active_count(), 0);

    assert_eq!(ctx.transitions.len(), 2);
    assert_eq!(ctx.transitions[0].flags, BarrierFlags::BEGIN_ONLY);
    assert_eq!(ctx.transitions[1].flags, BarrierFlags::END_ONLY);
    assert_eq!(ctx.transitions[0].resource, ctx.transitions[1].resource);
    assert_eq!(
        ctx.transitions[0].state_after,
        ctx.transitions[1].state_after
    );
}

#[test]
fn uncommitted_scope_does_not_leak_into_global() {
    let device = TestDevice::new();
    let global = GlobalStateManager::new();
    let texture = device.create_texture(&TextureDesc::default(), "isolated").unwrap();
    global.register(texture.id(), ResourceState::COMMON, 1);

    let mut ctx = device.context();
    {
        let mut scope = AutoBarrierScope::new(&mut ctx, None); // detached
        scope.use_as_render_target(&texture, ALL_SUBRESOURCES);
        scope.finalize();
    }
    assert_eq!(global.global_state(texture.id()), Some(ResourceState::COMMON));
}
