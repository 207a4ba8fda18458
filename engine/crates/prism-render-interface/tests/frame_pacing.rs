mod common;

use prism_gfx::{backend::headless::HeadlessCommand, resources::resource_state::ResourceState};
use prism_render_interface::frame_counter::FrameLabel;

#[test]
fn test_five_frames_wait_only_when_slot_in_flight() {
    let shader_dir = tempfile::tempdir().unwrap();
    let (headless, mut context) = common::new_context(shader_dir.path());
    context.flush_uploads().unwrap();

    let timeline = context.frame_pipeline().timeline_semaphore().handle();
    let mut labels = vec![];
    let mut waited = vec![];
    for frame in 0..5 {
        if frame == 4 {
            headless.complete_until(timeline, 2);
        }
        let begin = context.begin_frame().unwrap();
        labels.push(begin.label);
        waited.push(begin.waited);
        context.end_frame().unwrap();
    }

    assert_eq!(labels, vec![FrameLabel::A, FrameLabel::B, FrameLabel::C, FrameLabel::A, FrameLabel::B]);
    assert_eq!(waited, vec![false, false, false, true, false]);
    assert_eq!(context.frame_pipeline().last_signaled_value(), 5);

    let blocked_waits = headless.wait_log().into_iter().filter(|w| w.semaphore == timeline && w.blocked).collect::<Vec<_>>();
    assert_eq!(blocked_waits.len(), 1);
    assert_eq!(blocked_waits[0].value, 1);

    context.destroy();
}

#[test]
fn test_transition_to_current_state_records_nothing() {
    let shader_dir = tempfile::tempdir().unwrap();
    let (headless, mut context) = common::new_context(shader_dir.path());
    context.flush_uploads().unwrap();

    let default_texture = context.textures().default_texture().texture;
    context.begin_frame().unwrap();
    {
        let mut frame = context.frame_context();
        let texture = frame.textures.texture_mut(default_texture).unwrap();
        assert_eq!(texture.state(), ResourceState::ShaderResource);
        assert!(!texture.image_mut().transition(frame.device, frame.cmd, ResourceState::ShaderResource));
        assert!(texture.image_mut().transition(frame.device, frame.cmd, ResourceState::CopySource));
        assert!(texture.image_mut().transition(frame.device, frame.cmd, ResourceState::ShaderResource));

        let barriers = headless
            .recorded_commands(frame.cmd.vk_handle())
            .into_iter()
            .filter(|c| matches!(c, HeadlessCommand::PipelineBarrier { .. }))
            .count();
        assert_eq!(barriers, 2);
    }
    context.end_frame().unwrap();
    context.destroy();
}

#[test]
fn test_released_texture_outlives_in_flight_frame() {
    let shader_dir = tempfile::tempdir().unwrap();
    let (headless, mut context) = common::new_context(shader_dir.path());

    let pixels = [64u8; 8 * 8 * 4];
    let bundle = {
        let (_, descriptors, textures, _) = context.managers();
        textures
            .create_texture_from_image(descriptors, &pixels, 8, 8, ash::vk::Format::R8G8B8A8_UNORM, false, false, "t")
            .unwrap()
    };
    context.flush_uploads().unwrap();
    let live_before = headless.live_object_count();

    context.begin_frame().unwrap();
    {
        let mut frame = context.frame_context();
        assert!(frame.textures.release_texture(bundle.texture, frame.frame_pipeline));
    }
    context.end_frame().unwrap();
    assert_eq!(context.frame_pipeline().pending_release_count(), 1);
    assert_eq!(headless.live_object_count(), live_before);

    // 等到同一个 slot 再次开始时，第一帧的 fence 已经到达
    for _ in 0..3 {
        context.begin_frame().unwrap();
        context.end_frame().unwrap();
    }
    assert_eq!(context.frame_pipeline().pending_release_count(), 0);
    assert!(headless.live_object_count() < live_before);

    context.destroy();
}
